//! Chunked SHA-256 content digests.
//!
//! Every entry point feeds the hash in slices of at most `chunk_size`
//! bytes. SHA-256 is a streaming hash, so the result only depends on the
//! byte sequence and never on where chunk boundaries fall.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest as _, Sha256};
use std::io::{ErrorKind, Read};
use tokio::io::{AsyncRead, AsyncReadExt};

use anchorsync_common::{Digest, Error, Result};

/// Default chunk size for hashing (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Incremental digest state.
pub struct DigestWriter {
    hasher: Sha256,
    total_bytes: u64,
}

impl DigestWriter {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            total_bytes: 0,
        }
    }

    /// Feed more bytes.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.total_bytes += chunk.len() as u64;
    }

    /// Number of bytes hashed so far.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Consume the writer and produce the digest.
    pub fn finalize(self) -> Digest {
        Digest::from_bytes(self.hasher.finalize().into())
    }
}

impl Default for DigestWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes content digests over chunked input.
#[derive(Debug, Clone)]
pub struct ContentHasher {
    chunk_size: usize,
}

impl ContentHasher {
    /// Create a hasher with the default chunk size.
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set custom chunk size. A zero size falls back to one byte.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Digest an async byte source, reading at most `chunk_size` bytes at a time.
    ///
    /// # Errors
    /// - Read errors from the underlying source are propagated; the digest
    ///   of a partially read source is never returned
    pub async fn digest<R: AsyncRead + Unpin>(&self, mut reader: R) -> Result<Digest> {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut writer = DigestWriter::new();

        loop {
            let bytes_read = reader.read(&mut buffer).await?;
            if bytes_read == 0 {
                break;
            }
            writer.update(&buffer[..bytes_read]);
        }

        tracing::trace!("Hashed {} bytes", writer.total_bytes());
        Ok(writer.finalize())
    }

    /// Digest a blocking reader, chunk by chunk.
    pub fn digest_reader<R: Read>(&self, mut reader: R) -> Result<Digest> {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut writer = DigestWriter::new();

        loop {
            let bytes_read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            writer.update(&buffer[..bytes_read]);
        }

        Ok(writer.finalize())
    }

    /// Digest a stream of byte chunks of arbitrary size.
    ///
    /// Oversized items are split so the hash is never fed more than
    /// `chunk_size` bytes at once.
    pub async fn digest_stream<S>(&self, mut stream: S) -> Result<Digest>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let mut writer = DigestWriter::new();

        while let Some(item) = stream.next().await {
            let item = item?;
            for chunk in item.chunks(self.chunk_size) {
                writer.update(chunk);
            }
        }

        Ok(writer.finalize())
    }

    /// Digest an in-memory buffer.
    pub fn digest_bytes(&self, data: &[u8]) -> Digest {
        let mut writer = DigestWriter::new();
        for chunk in data.chunks(self.chunk_size) {
            writer.update(chunk);
        }
        writer.finalize()
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use proptest::prelude::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_known_vectors() {
        let hasher = ContentHasher::new();
        assert_eq!(hasher.digest_bytes(b"").to_hex(), EMPTY_SHA256);
        assert_eq!(hasher.digest_bytes(b"abc").to_hex(), ABC_SHA256);
    }

    #[tokio::test]
    async fn test_async_reader_matches_bytes() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let hasher = ContentHasher::new().with_chunk_size(4096);

        let from_reader = hasher.digest(&data[..]).await.unwrap();
        assert_eq!(from_reader, hasher.digest_bytes(&data));
    }

    #[tokio::test]
    async fn test_stream_with_oversized_items() {
        let hasher = ContentHasher::new().with_chunk_size(3);
        let items = vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"c")),
        ];
        let digest = hasher.digest_stream(stream::iter(items)).await.unwrap();
        assert_eq!(digest.to_hex(), ABC_SHA256);
    }

    struct FailingReader {
        served: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.served {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
            } else {
                self.served = true;
                buf.put_slice(b"partial");
                Poll::Ready(Ok(()))
            }
        }
    }

    #[tokio::test]
    async fn test_read_error_is_propagated() {
        let hasher = ContentHasher::new();
        let result = hasher.digest(FailingReader { served: false }).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_stream_error_is_propagated() {
        let hasher = ContentHasher::new();
        let items = vec![
            Ok(Bytes::from_static(b"abc")),
            Err(Error::Network("reset".to_string())),
        ];
        let result = futures::executor::block_on(hasher.digest_stream(stream::iter(items)));
        assert!(matches!(result, Err(Error::Network(_))));
    }

    proptest! {
        #[test]
        fn prop_digest_independent_of_chunking(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            split in 0usize..4096,
            chunk_size in 1usize..512,
        ) {
            let split = split.min(data.len());
            let hasher = ContentHasher::new().with_chunk_size(chunk_size);

            let mut writer = DigestWriter::new();
            writer.update(&data[..split]);
            writer.update(&data[split..]);

            let whole = ContentHasher::new().digest_bytes(&data);
            prop_assert_eq!(writer.finalize(), whole);
            prop_assert_eq!(hasher.digest_bytes(&data), whole);
            prop_assert_eq!(hasher.digest_reader(&data[..]).unwrap(), whole);
        }
    }
}
