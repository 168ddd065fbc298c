// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! I/O helpers: compression wrappers and content digests. */

use {
    crate::error::{Result, RpmRepositoryError},
    async_compression::futures::bufread::{GzipDecoder, GzipEncoder},
    futures::{AsyncBufRead, AsyncRead, AsyncReadExt},
    pin_project::pin_project,
    serde::Deserialize,
    std::{
        fmt::Formatter,
        pin::Pin,
        str::FromStr,
        task::{Context, Poll},
    },
};

/// Compression format.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Compression {
    /// No compression.
    None,
    /// Gzip compression.
    Gzip,
}

impl Compression {
    /// Filename extension for files compressed in this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
        }
    }

    /// Resolve the compression of a path from its extension.
    pub fn from_path(path: &str) -> Self {
        if path.ends_with(".gz") {
            Self::Gzip
        } else {
            Self::None
        }
    }
}

/// Wrap a reader with transparent decompression.
pub fn read_decompressed<'a>(
    stream: impl AsyncBufRead + Send + 'a,
    compression: Compression,
) -> Pin<Box<dyn AsyncRead + Send + 'a>> {
    match compression {
        Compression::None => Box::pin(stream),
        Compression::Gzip => Box::pin(GzipDecoder::new(stream)),
    }
}

/// Wrap a reader with transparent compression.
pub fn read_compressed<'a>(
    stream: impl AsyncBufRead + Send + 'a,
    compression: Compression,
) -> Pin<Box<dyn AsyncRead + Send + 'a>> {
    match compression {
        Compression::None => Box::pin(stream),
        Compression::Gzip => Box::pin(GzipEncoder::new(stream)),
    }
}

/// A content digest algorithm.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq)]
#[serde(try_from = "String")]
pub enum DigestAlgorithm {
    /// SHA-1.
    Sha1,
    /// SHA-256.
    Sha256,
}

impl Default for DigestAlgorithm {
    fn default() -> Self {
        Self::Sha256
    }
}

impl DigestAlgorithm {
    /// The name of this algorithm as it appears in `type` attributes of metadata XML.
    pub fn xml_name(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha",
            Self::Sha256 => "sha256",
        }
    }

    /// Create a new hasher for this algorithm.
    pub fn new_hasher(&self) -> Box<dyn digest::DynDigest + Send> {
        match self {
            Self::Sha1 => Box::new(sha1::Sha1::default()),
            Self::Sha256 => Box::new(sha2::Sha256::default()),
        }
    }

    /// Digest a slice of bytes.
    pub fn digest_bytes(&self, data: &[u8]) -> ContentDigest {
        let mut hasher = self.new_hasher();
        hasher.update(data);

        ContentDigest::from_algorithm(*self, hasher.finalize().to_vec())
    }

    /// Digest all content of a reader, returning the digest and the number of bytes read.
    pub async fn digest_reader(
        &self,
        reader: impl AsyncRead + Unpin,
    ) -> std::io::Result<(ContentDigest, u64)> {
        let mut reader = DigestingReader::new(reader, *self);
        let mut buf = [0u8; 16384];

        loop {
            if reader.read(&mut buf[..]).await? == 0 {
                break;
            }
        }

        let (_, digest, size) = reader.finish();

        Ok((digest, size))
    }
}

impl FromStr for DigestAlgorithm {
    type Err = RpmRepositoryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sha" | "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            _ => Err(RpmRepositoryError::UnknownDigestFormat(s.to_string())),
        }
    }
}

impl TryFrom<String> for DigestAlgorithm {
    type Error = RpmRepositoryError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::from_str(&value)
    }
}

/// Represents a content digest.
#[derive(Clone, Eq, Hash, PartialEq, PartialOrd)]
pub enum ContentDigest {
    /// A SHA-1 digest.
    Sha1(Vec<u8>),
    /// A SHA-256 digest.
    Sha256(Vec<u8>),
}

impl std::fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sha1(data) => write!(f, "Sha1({})", hex::encode(data)),
            Self::Sha256(data) => write!(f, "Sha256({})", hex::encode(data)),
        }
    }
}

impl ContentDigest {
    /// Construct an instance from raw digest bytes.
    pub fn from_algorithm(algorithm: DigestAlgorithm, digest: Vec<u8>) -> Self {
        match algorithm {
            DigestAlgorithm::Sha1 => Self::Sha1(digest),
            DigestAlgorithm::Sha256 => Self::Sha256(digest),
        }
    }

    /// Obtain an instance by parsing a hex string as a [DigestAlgorithm].
    pub fn from_hex_digest(algorithm: DigestAlgorithm, digest: &str) -> Result<Self> {
        let digest = hex::decode(digest)
            .map_err(|e| RpmRepositoryError::ContentDigestBadHex(digest.to_string(), e))?;

        Ok(Self::from_algorithm(algorithm, digest))
    }

    /// Obtain the digest bytes for this content digest.
    pub fn digest_bytes(&self) -> &[u8] {
        match self {
            Self::Sha1(x) => x,
            Self::Sha256(x) => x,
        }
    }

    /// Obtain the hex encoded content digest.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest_bytes())
    }

    /// Obtain the [DigestAlgorithm] for this digest.
    pub fn algorithm(&self) -> DigestAlgorithm {
        match self {
            Self::Sha1(_) => DigestAlgorithm::Sha1,
            Self::Sha256(_) => DigestAlgorithm::Sha256,
        }
    }
}

/// An [AsyncRead] stream adapter that computes a [ContentDigest] as data is read.
#[pin_project]
pub struct DigestingReader<R> {
    hasher: Box<dyn digest::DynDigest + Send>,
    algorithm: DigestAlgorithm,
    #[pin]
    source: R,
    bytes_read: u64,
}

impl<R> DigestingReader<R> {
    /// Construct a new instance from a source reader.
    pub fn new(source: R, algorithm: DigestAlgorithm) -> Self {
        Self {
            hasher: algorithm.new_hasher(),
            algorithm,
            source,
            bytes_read: 0,
        }
    }

    /// Finish the stream.
    ///
    /// Returns the source reader, the resolved [ContentDigest] and the number of bytes read.
    pub fn finish(self) -> (R, ContentDigest, u64) {
        let digest = ContentDigest::from_algorithm(self.algorithm, self.hasher.finalize().to_vec());

        (self.source, digest, self.bytes_read)
    }
}

impl<R> AsyncRead for DigestingReader<R>
where
    R: AsyncRead,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();

        match this.source.poll_read(cx, buf) {
            Poll::Ready(Ok(size)) => {
                if size > 0 {
                    this.hasher.update(&buf[0..size]);
                    *this.bytes_read += size as u64;
                }

                Poll::Ready(Ok(size))
            }
            res => res,
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, futures::AsyncReadExt};

    #[test]
    fn algorithm_names() -> Result<()> {
        assert_eq!(DigestAlgorithm::from_str("sha1")?, DigestAlgorithm::Sha1);
        assert_eq!(DigestAlgorithm::from_str("sha")?, DigestAlgorithm::Sha1);
        assert_eq!(DigestAlgorithm::from_str("sha256")?, DigestAlgorithm::Sha256);
        assert!(DigestAlgorithm::from_str("md5").is_err());
        assert_eq!(DigestAlgorithm::Sha1.xml_name(), "sha");
        assert_eq!(DigestAlgorithm::default().xml_name(), "sha256");

        Ok(())
    }

    #[tokio::test]
    async fn digesting_reader() -> Result<()> {
        let (digest, size) = DigestAlgorithm::Sha256
            .digest_reader(futures::io::Cursor::new(b"hello world".to_vec()))
            .await?;

        assert_eq!(size, 11);
        assert_eq!(
            digest.digest_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(digest, DigestAlgorithm::Sha256.digest_bytes(b"hello world"));

        let (digest, _) = DigestAlgorithm::Sha1
            .digest_reader(futures::io::Cursor::new(b"hello world".to_vec()))
            .await?;
        assert_eq!(
            digest.digest_hex(),
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );

        Ok(())
    }

    #[tokio::test]
    async fn gzip_round_trip() -> Result<()> {
        let source = b"<metadata packages=\"0\"/>".to_vec();

        let mut compressed = vec![];
        read_compressed(futures::io::Cursor::new(source.clone()), Compression::Gzip)
            .read_to_end(&mut compressed)
            .await?;
        assert_ne!(compressed, source);

        let mut decompressed = vec![];
        read_decompressed(
            futures::io::Cursor::new(compressed),
            Compression::from_path("primary.xml.gz"),
        )
        .read_to_end(&mut decompressed)
        .await?;
        assert_eq!(decompressed, source);

        Ok(())
    }
}
