use std::io;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{BoxedReader, BoxedWriter, ChannelBackend};

/// Channel which copies each buffer onto the stream right after the payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicChannel;

impl ChannelBackend for BasicChannel {
    fn send_buffers<'a>(
        &'a self,
        writer: &'a mut BoxedWriter,
        buffers: &'a [Bytes],
    ) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            for buf in buffers {
                writer.write_all(buf).await?;
            }
            Ok(())
        })
    }

    fn recv_buffers<'a>(
        &'a self,
        reader: &'a mut BoxedReader,
        buffers: &'a mut [BytesMut],
    ) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            for buf in buffers.iter_mut() {
                reader.read_exact(&mut buf[..]).await?;
            }
            Ok(())
        })
    }
}
