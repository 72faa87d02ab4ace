use crate::bitfield::BitField;
use crate::files::{FileSet, FileSlice};
use log::{debug, warn};
use sha1::{Digest, Sha1};
use std::io;

/// Bytes per chunk on the peer wire; the last chunk of a piece may be shorter.
pub const CHUNK_LENGTH: u32 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Idle,
    InProgress,
    Verifying,
    Complete,
}

/// What a received chunk did to the piece.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stored; more chunks outstanding.
    InProgress,
    /// Last chunk arrived, the hash matched, bytes are on disk.
    Verified,
    /// Last chunk arrived but the hash did not match; chunk state was discarded.
    Corrupt,
    /// Duplicate or malformed chunk, dropped.
    Ignored,
}

/// The atomic unit of integrity: one entry in the descriptor's hash list,
/// always verified whole against its expected SHA-1.
pub struct Piece {
    index: u32,
    offset: u64,
    length: u32,
    expected_hash: [u8; 20],
    file_mapping: Vec<FileSlice>,
    state: PieceState,
    requested: Vec<bool>,
    received: Vec<bool>,
    buffer: Vec<u8>,
}

impl Piece {
    fn new(index: u32, offset: u64, length: u32, expected_hash: [u8; 20], files: &FileSet) -> Piece {
        let num_chunks = ((length + CHUNK_LENGTH - 1) / CHUNK_LENGTH) as usize;
        Piece {
            index,
            offset,
            length,
            expected_hash,
            file_mapping: files.map_extent(offset, length as u64),
            state: PieceState::Idle,
            requested: vec![false; num_chunks],
            received: vec![false; num_chunks],
            buffer: Vec::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn state(&self) -> PieceState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == PieceState::Complete
    }

    /// The (file, offset, length) runs covering this piece's extent.
    pub fn file_mapping(&self) -> &[FileSlice] {
        &self.file_mapping
    }

    pub fn num_chunks(&self) -> usize {
        self.requested.len()
    }

    fn chunk_length(&self, chunk: usize) -> u32 {
        let begin = chunk as u32 * CHUNK_LENGTH;
        CHUNK_LENGTH.min(self.length - begin)
    }

    pub fn has_requested_all_chunks(&self) -> bool {
        self.requested.iter().all(|&r| r)
    }

    /// Hands out the next chunk to request as `(begin, length)`, marking it
    /// outstanding. The first request moves the piece from Idle to InProgress.
    pub fn next_request(&mut self) -> Option<(u32, u32)> {
        if self.state == PieceState::Complete || self.state == PieceState::Verifying {
            return None;
        }
        let chunk = self.requested.iter().position(|&r| !r)?;
        self.requested[chunk] = true;
        if self.state == PieceState::Idle {
            self.state = PieceState::InProgress;
            self.buffer = vec![0u8; self.length as usize];
        }
        Some((chunk as u32 * CHUNK_LENGTH, self.chunk_length(chunk)))
    }

    /// Stores a received chunk. When the last chunk lands the buffer is
    /// hashed; on a match the bytes are persisted through the file mapping,
    /// on a mismatch every received chunk is discarded.
    pub fn receive_chunk(
        &mut self,
        begin: u32,
        data: &[u8],
        files: &mut FileSet,
    ) -> io::Result<ChunkOutcome> {
        if self.state == PieceState::Complete || self.state == PieceState::Verifying {
            return Ok(ChunkOutcome::Ignored);
        }
        if begin % CHUNK_LENGTH != 0 {
            debug!("piece {}: misaligned chunk at {}", self.index, begin);
            return Ok(ChunkOutcome::Ignored);
        }
        let chunk = (begin / CHUNK_LENGTH) as usize;
        if chunk >= self.num_chunks() || data.len() as u32 != self.chunk_length(chunk) {
            debug!("piece {}: bad chunk {}+{}", self.index, begin, data.len());
            return Ok(ChunkOutcome::Ignored);
        }
        if self.received[chunk] {
            return Ok(ChunkOutcome::Ignored);
        }

        if self.state == PieceState::Idle {
            // unsolicited but well-formed, keep it
            self.state = PieceState::InProgress;
            self.buffer = vec![0u8; self.length as usize];
        }
        let at = begin as usize;
        self.buffer[at..at + data.len()].copy_from_slice(data);
        self.received[chunk] = true;
        self.requested[chunk] = true;
        if !self.received.iter().all(|&r| r) {
            return Ok(ChunkOutcome::InProgress);
        }

        self.state = PieceState::Verifying;
        let mut hasher = Sha1::new();
        hasher.update(&self.buffer);
        let hash: [u8; 20] = hasher.finalize().into();
        if hash != self.expected_hash {
            warn!("piece {} failed verification, discarding chunks", self.index);
            self.reset();
            return Ok(ChunkOutcome::Corrupt);
        }

        let mut at = 0usize;
        for slice in self.file_mapping.clone() {
            let end = at + slice.length as usize;
            if let Err(e) = files.write_slice(&slice, &self.buffer[at..end]) {
                self.reset();
                return Err(e);
            }
            at = end;
        }
        self.state = PieceState::Complete;
        self.buffer = Vec::new();
        self.requested = Vec::new();
        self.received = Vec::new();
        Ok(ChunkOutcome::Verified)
    }

    /// Returns outstanding-but-unreceived chunks to the requestable pool,
    /// used when the peer serving them goes away. A piece with no received
    /// chunks drops back to Idle.
    pub fn release(&mut self) {
        if self.state != PieceState::InProgress {
            return;
        }
        for (requested, &received) in self.requested.iter_mut().zip(self.received.iter()) {
            if !received {
                *requested = false;
            }
        }
        if !self.received.iter().any(|&r| r) {
            self.reset();
        }
    }

    fn reset(&mut self) {
        let num_chunks = ((self.length + CHUNK_LENGTH - 1) / CHUNK_LENGTH) as usize;
        self.state = PieceState::Idle;
        self.requested = vec![false; num_chunks];
        self.received = vec![false; num_chunks];
        self.buffer = Vec::new();
    }

    /// Reads this piece's extent from disk and checks it against the expected
    /// hash, marking the piece Complete on a match. Read failures count as
    /// not-complete rather than failing the torrent.
    pub fn verify_on_disk(&mut self, files: &mut FileSet) -> bool {
        let mut buf = vec![0u8; self.length as usize];
        let mut at = 0usize;
        for slice in &self.file_mapping {
            let end = at + slice.length as usize;
            if let Err(e) = files.read_slice(slice, &mut buf[at..end]) {
                warn!("piece {}: read failed during verify: {}", self.index, e);
                return false;
            }
            at = end;
        }
        let mut hasher = Sha1::new();
        hasher.update(&buf);
        let hash: [u8; 20] = hasher.finalize().into();
        if hash == self.expected_hash {
            self.state = PieceState::Complete;
            true
        } else {
            false
        }
    }
}

/// Ordered sequence of pieces covering the payload.
pub struct PieceIndex {
    pieces: Vec<Piece>,
}

impl PieceIndex {
    /// Lays the hash list over the payload: every piece is `piece_length`
    /// bytes except the last, which takes whatever remains.
    pub fn build(hashes: &[[u8; 20]], piece_length: u32, size: u64, files: &FileSet) -> PieceIndex {
        let pieces = hashes
            .iter()
            .enumerate()
            .map(|(i, &hash)| {
                let offset = i as u64 * piece_length as u64;
                let length = (size - offset).min(piece_length as u64) as u32;
                Piece::new(i as u32, offset, length, hash, files)
            })
            .collect();
        PieceIndex { pieces }
    }

    /// Sequentially verifies every piece against the bytes already on disk
    /// and returns the bitfield of pieces found present.
    pub fn scan(&mut self, files: &mut FileSet) -> BitField {
        let mut completed = BitField::new(self.pieces.len());
        for piece in &mut self.pieces {
            if piece.verify_on_disk(files) {
                completed.set(piece.index() as usize);
            }
        }
        debug!(
            "initial scan: {}/{} pieces present",
            completed.count(),
            self.pieces.len()
        );
        completed
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Piece> {
        self.pieces.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Piece> {
        self.pieces.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Piece> {
        self.pieces.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::FilePlan;
    use std::path::PathBuf;

    fn sha1_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn file_set(dir: &std::path::Path, length: u64) -> FileSet {
        FileSet::create(
            dir,
            &[FilePlan {
                path: PathBuf::from("payload"),
                length,
                offset: 0,
            }],
        )
        .unwrap()
    }

    #[test]
    fn test_piece_lengths_and_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let files = file_set(dir.path(), 40_000);
        let index = PieceIndex::build(&[[0; 20], [0; 20], [0; 20]], 16_384, 40_000, &files);
        assert_eq!(index.len(), 3);
        assert_eq!(index.get(0).unwrap().length(), 16_384);
        assert_eq!(index.get(2).unwrap().length(), 40_000 - 2 * 16_384);
        assert_eq!(index.get(0).unwrap().num_chunks(), 1);
        assert_eq!(index.get(2).unwrap().num_chunks(), 1);
    }

    #[test]
    fn test_next_request_walks_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let files = file_set(dir.path(), 40_000);
        let mut index = PieceIndex::build(&[sha1_of(&vec![7u8; 40_000])], 40_000, 40_000, &files);
        let piece = index.get_mut(0).unwrap();
        assert_eq!(piece.state(), PieceState::Idle);
        assert_eq!(piece.next_request(), Some((0, CHUNK_LENGTH)));
        assert_eq!(piece.state(), PieceState::InProgress);
        assert_eq!(piece.next_request(), Some((CHUNK_LENGTH, CHUNK_LENGTH)));
        assert_eq!(
            piece.next_request(),
            Some((2 * CHUNK_LENGTH, 40_000 - 2 * CHUNK_LENGTH))
        );
        assert!(piece.has_requested_all_chunks());
        assert_eq!(piece.next_request(), None);
    }

    #[test]
    fn test_receive_verify_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = file_set(dir.path(), 40_000);
        let content = vec![7u8; 40_000];
        let mut index = PieceIndex::build(&[sha1_of(&content)], 40_000, 40_000, &files);
        let piece = index.get_mut(0).unwrap();
        while piece.next_request().is_some() {}

        let chunk = CHUNK_LENGTH as usize;
        assert_eq!(
            piece
                .receive_chunk(0, &content[..chunk], &mut files)
                .unwrap(),
            ChunkOutcome::InProgress
        );
        assert_eq!(
            piece
                .receive_chunk(CHUNK_LENGTH, &content[chunk..2 * chunk], &mut files)
                .unwrap(),
            ChunkOutcome::InProgress
        );
        assert_eq!(
            piece
                .receive_chunk(2 * CHUNK_LENGTH, &content[2 * chunk..], &mut files)
                .unwrap(),
            ChunkOutcome::Verified
        );
        assert!(piece.is_complete());
        assert_eq!(files.read(0, 40_000).unwrap(), content);
    }

    #[test]
    fn test_corrupt_piece_discards_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = file_set(dir.path(), 100);
        let mut index = PieceIndex::build(&[sha1_of(b"expected")], 100, 100, &files);
        let piece = index.get_mut(0).unwrap();
        piece.next_request();
        let outcome = piece
            .receive_chunk(0, &vec![9u8; 100], &mut files)
            .unwrap();
        assert_eq!(outcome, ChunkOutcome::Corrupt);
        assert_eq!(piece.state(), PieceState::Idle);
        assert!(!piece.has_requested_all_chunks());
        // on-disk bytes untouched
        assert_eq!(files.read(0, 100).unwrap(), vec![0u8; 100]);
    }

    #[test]
    fn test_duplicate_and_malformed_chunks_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = file_set(dir.path(), 40_000);
        let content = vec![3u8; 40_000];
        let mut index = PieceIndex::build(&[sha1_of(&content)], 40_000, 40_000, &files);
        let piece = index.get_mut(0).unwrap();
        piece.next_request();
        let chunk = CHUNK_LENGTH as usize;
        piece.receive_chunk(0, &content[..chunk], &mut files).unwrap();
        assert_eq!(
            piece.receive_chunk(0, &content[..chunk], &mut files).unwrap(),
            ChunkOutcome::Ignored
        );
        assert_eq!(
            piece.receive_chunk(3, &content[..chunk], &mut files).unwrap(),
            ChunkOutcome::Ignored
        );
        assert_eq!(
            piece.receive_chunk(0, &content[..10], &mut files).unwrap(),
            ChunkOutcome::Ignored
        );
    }

    #[test]
    fn test_release_requeues_unreceived_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = file_set(dir.path(), 40_000);
        let content = vec![5u8; 40_000];
        let mut index = PieceIndex::build(&[sha1_of(&content)], 40_000, 40_000, &files);
        let piece = index.get_mut(0).unwrap();
        while piece.next_request().is_some() {}
        piece
            .receive_chunk(0, &content[..CHUNK_LENGTH as usize], &mut files)
            .unwrap();

        piece.release();
        assert_eq!(piece.state(), PieceState::InProgress);
        assert!(!piece.has_requested_all_chunks());
        // the first received chunk stays, the others are requestable again
        assert_eq!(piece.next_request(), Some((CHUNK_LENGTH, CHUNK_LENGTH)));
    }

    #[test]
    fn test_release_without_received_chunks_goes_idle() {
        let dir = tempfile::tempdir().unwrap();
        let files = file_set(dir.path(), 100);
        let mut index = PieceIndex::build(&[[0u8; 20]], 100, 100, &files);
        let piece = index.get_mut(0).unwrap();
        piece.next_request();
        piece.release();
        assert_eq!(piece.state(), PieceState::Idle);
    }

    #[test]
    fn test_mapping_spans_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileSet::create(
            dir.path(),
            &[
                FilePlan {
                    path: PathBuf::from("t/x"),
                    length: 3,
                    offset: 0,
                },
                FilePlan {
                    path: PathBuf::from("t/y"),
                    length: 3,
                    offset: 3,
                },
            ],
        )
        .unwrap();
        let index = PieceIndex::build(&[[0; 20], [0; 20]], 4, 6, &files);
        assert_eq!(
            index.get(0).unwrap().file_mapping(),
            &[
                crate::files::FileSlice {
                    file: 0,
                    offset: 0,
                    length: 3
                },
                crate::files::FileSlice {
                    file: 1,
                    offset: 0,
                    length: 1
                },
            ]
        );
        assert_eq!(
            index.get(1).unwrap().file_mapping(),
            &[crate::files::FileSlice {
                file: 1,
                offset: 1,
                length: 2
            }]
        );
    }

    #[test]
    fn test_scan_detects_present_pieces() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("payload"), b"abcdef").unwrap();
        let mut files = file_set(dir.path(), 6);
        let mut index =
            PieceIndex::build(&[sha1_of(b"abcd"), sha1_of(b"ef")], 4, 6, &files);
        let completed = index.scan(&mut files);
        assert_eq!(completed.set_indices(), vec![0, 1]);
        assert!(index.get(0).unwrap().is_complete());

        // a zeroed payload matches nothing
        let dir2 = tempfile::tempdir().unwrap();
        let mut files2 = file_set(dir2.path(), 6);
        let mut index2 =
            PieceIndex::build(&[sha1_of(b"abcd"), sha1_of(b"ef")], 4, 6, &files2);
        assert_eq!(index2.scan(&mut files2).count(), 0);
    }
}
