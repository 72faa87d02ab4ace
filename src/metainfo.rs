use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_bencode::{from_bytes, to_bytes};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize)]
pub struct Node(String, i64);

/// One entry of `info.files` in a multi-file descriptor.
#[derive(Debug, Deserialize, Serialize)]
pub struct FileEntry {
    /// Path components under the torrent directory; the last one is the file name.
    pub path: Vec<String>,
    /// File length in bytes.
    pub length: i64,
    /// (optional) MD5 of the file; unused by the protocol but carried by some clients.
    #[serde(default)]
    pub md5sum: Option<String>,
}

/// The `info` sub-dictionary. The optional keys are kept so that descriptors
/// carrying them re-encode to the original byte layout and hash correctly.
#[derive(Debug, Deserialize, Serialize)]
pub struct Info {
    pub name: String,
    /// Concatenation of 20-byte SHA-1 digests, one per piece.
    pub pieces: ByteBuf,
    /// Nominal bytes per piece.
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    #[serde(default)]
    pub md5sum: Option<String>,
    /// Present in single-file descriptors, absent in multi-file ones.
    #[serde(default)]
    pub length: Option<i64>,
    #[serde(default)]
    pub files: Option<Vec<FileEntry>>,
    #[serde(default)]
    pub private: Option<u8>,
    #[serde(default)]
    pub path: Option<Vec<String>>,
    #[serde(default)]
    #[serde(rename = "root hash")]
    pub root_hash: Option<String>,
}

/// A parsed metainfo (.torrent) descriptor.
#[derive(Debug, Deserialize, Serialize)]
pub struct Metainfo {
    info: Info,
    /// The announce URL of the tracker.
    #[serde(default)]
    announce: Option<String>,
    #[serde(default)]
    nodes: Option<Vec<Node>>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    httpseeds: Option<Vec<String>>,
    /// (optional) BEP-12 tiered tracker list.
    #[serde(default)]
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    /// (optional) creation time, seconds since the UNIX epoch.
    #[serde(default)]
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,
    #[serde(rename = "comment")]
    comment: Option<String>,
    #[serde(default)]
    #[serde(rename = "created by")]
    created_by: Option<String>,
}

/// One backing file of the payload, with its position in the flat range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePlan {
    /// Path relative to the download directory, torrent name included.
    pub path: PathBuf,
    pub length: u64,
    /// Offset of the file's first byte in the payload range `[0, size)`.
    pub offset: u64,
}

/// Everything the coordinator needs from a descriptor, validated.
#[derive(Debug, Clone)]
pub struct TorrentPlan {
    pub name: String,
    pub info_hash: [u8; 20],
    pub piece_length: u32,
    pub size: u64,
    pub files: Vec<FilePlan>,
    pub piece_hashes: Vec<[u8; 20]>,
    pub announce_urls: Vec<String>,
}

impl TorrentPlan {
    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }
}

impl Metainfo {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        from_bytes(bytes).context("failed to parse metainfo")
    }

    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let buf = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_bytes(&buf)
    }

    /// SHA-1 over the canonically re-encoded `info` dictionary. serde_bencode
    /// emits sorted keys and omits absent optional fields, so the digest
    /// matches one taken over the source bytes.
    pub fn info_hash(&self) -> anyhow::Result<[u8; 20]> {
        let bytes = to_bytes(&self.info).context("failed to re-encode info dictionary")?;
        let mut hasher = Sha1::new();
        hasher.update(&bytes);
        Ok(hasher.finalize().into())
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Union of `announce` and the flattened `announce-list`, de-duplicated
    /// with insertion order preserved.
    pub fn announce_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        let mut push = |url: &str| {
            if !url.is_empty() && !urls.iter().any(|u| u == url) {
                urls.push(url.to_string());
            }
        };
        if let Some(announce) = &self.announce {
            push(announce);
        }
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                for url in tier {
                    push(url);
                }
            }
        }
        urls
    }

    /// Validates the descriptor and lays out the piece and file plans.
    pub fn plan(&self) -> anyhow::Result<TorrentPlan> {
        let info = &self.info;
        if info.piece_length <= 0 {
            bail!("piece length must be positive, got {}", info.piece_length);
        }
        let piece_length = info.piece_length as u64;
        if info.pieces.len() % 20 != 0 {
            bail!(
                "pieces is {} bytes, not a multiple of 20",
                info.pieces.len()
            );
        }

        let files = match (&info.length, &info.files) {
            (Some(_), Some(_)) => bail!("metainfo has both info.length and info.files"),
            (None, None) => bail!("metainfo has neither info.length nor info.files"),
            (Some(length), None) => {
                if *length < 0 {
                    bail!("negative file length {}", length);
                }
                vec![FilePlan {
                    path: PathBuf::from(&info.name),
                    length: *length as u64,
                    offset: 0,
                }]
            }
            (None, Some(entries)) => {
                let mut plans = Vec::with_capacity(entries.len());
                let mut offset = 0u64;
                for entry in entries {
                    if entry.length < 0 {
                        bail!("negative file length {}", entry.length);
                    }
                    if entry.path.is_empty() {
                        bail!("file entry with empty path");
                    }
                    let mut path = PathBuf::from(&info.name);
                    for component in &entry.path {
                        path.push(component);
                    }
                    plans.push(FilePlan {
                        path,
                        length: entry.length as u64,
                        offset,
                    });
                    offset += entry.length as u64;
                }
                plans
            }
        };

        let size: u64 = files.iter().map(|f| f.length).sum();
        if size == 0 {
            bail!("torrent payload is empty");
        }

        let piece_hashes: Vec<[u8; 20]> = info
            .pieces
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();
        let expected = ((size + piece_length - 1) / piece_length) as usize;
        if piece_hashes.len() != expected {
            bail!(
                "descriptor has {} piece hashes, payload needs {}",
                piece_hashes.len(),
                expected
            );
        }

        Ok(TorrentPlan {
            name: info.name.clone(),
            info_hash: self.info_hash()?,
            piece_length: info.piece_length as u32,
            size,
            files,
            piece_hashes,
            announce_urls: self.announce_urls(),
        })
    }
}
