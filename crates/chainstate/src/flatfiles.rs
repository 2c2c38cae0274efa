//! Numbered append-only record files (`blkNNNNN.dat`, `revNNNNN.dat`).
//!
//! Every record is framed as `[magic: 4][len: u32 LE][payload]`. A [`FileLocation`]
//! points at the start of the frame.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const RECORD_HEADER_LEN: u64 = 8;
/// Frames announcing more than this are treated as garbage by the scanner.
pub const MAX_RECORD_LEN: u32 = 32 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        let file_id = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let offset = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
        let len = u32::from_le_bytes(bytes[12..16].try_into().ok()?);
        Some(Self {
            file_id,
            offset,
            len,
        })
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(std::io::Error),
    InvalidLocation,
    LengthMismatch,
    BadMagic,
    Poisoned,
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "{err}"),
            FlatFileError::InvalidLocation => write!(f, "invalid flatfile location"),
            FlatFileError::LengthMismatch => write!(f, "flatfile length mismatch"),
            FlatFileError::BadMagic => write!(f, "flatfile record has wrong network magic"),
            FlatFileError::Poisoned => write!(f, "flatfile lock poisoned"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

pub struct FlatFileStore {
    dir: PathBuf,
    prefix: String,
    magic: [u8; 4],
    max_file_size: u64,
    state: Mutex<FlatFileState>,
}

#[derive(Debug)]
struct FlatFileState {
    current_file: u32,
    current_len: u64,
}

impl FlatFileStore {
    pub fn new_with_prefix(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        magic: [u8; 4],
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        let dir = dir.into();
        let prefix = prefix.into();
        std::fs::create_dir_all(&dir)?;
        let (current_file, current_len) = Self::locate_active_file(&dir, &prefix, max_file_size)?;
        Ok(Self {
            dir,
            prefix,
            magic,
            max_file_size,
            state: Mutex::new(FlatFileState {
                current_file,
                current_len,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(&self, bytes: &[u8]) -> Result<FileLocation, FlatFileError> {
        let mut state = self.state.lock().map_err(|_| FlatFileError::Poisoned)?;
        let needed = RECORD_HEADER_LEN + bytes.len() as u64;
        if state.current_len > 0 && state.current_len + needed > self.max_file_size {
            state.current_file += 1;
            state.current_len = 0;
        }
        let offset = state.current_len;
        let path = self.file_path(state.current_file);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = u32::try_from(bytes.len()).map_err(|_| FlatFileError::InvalidLocation)?;
        let mut frame = Vec::with_capacity(needed as usize);
        frame.extend_from_slice(&self.magic);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(bytes);
        file.write_all(&frame)?;
        file.flush()?;
        state.current_len += needed;
        Ok(FileLocation {
            file_id: state.current_file,
            offset,
            len,
        })
    }

    /// Appends to a specific numbered file regardless of the roll-over position.
    pub fn append_to_file(&self, file_id: u32, bytes: &[u8]) -> Result<FileLocation, FlatFileError> {
        let _state = self.state.lock().map_err(|_| FlatFileError::Poisoned)?;
        let path = self.file_path(file_id);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let offset = file.metadata()?.len();
        let len = u32::try_from(bytes.len()).map_err(|_| FlatFileError::InvalidLocation)?;
        let mut frame = Vec::with_capacity(RECORD_HEADER_LEN as usize + bytes.len());
        frame.extend_from_slice(&self.magic);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(bytes);
        file.write_all(&frame)?;
        file.flush()?;
        Ok(FileLocation {
            file_id,
            offset,
            len,
        })
    }

    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        if location.len == 0 {
            return Err(FlatFileError::InvalidLocation);
        }
        let path = self.file_path(location.file_id);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if header[0..4] != self.magic {
            return Err(FlatFileError::BadMagic);
        }
        let stored_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if stored_len != location.len {
            return Err(FlatFileError::LengthMismatch);
        }
        let mut buffer = vec![0u8; stored_len as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Forces the file currently being appended to onto stable storage.
    pub fn sync(&self) -> Result<(), FlatFileError> {
        let current = self.current_file()?;
        self.sync_file(current)
    }

    pub fn sync_file(&self, file_id: u32) -> Result<(), FlatFileError> {
        match File::open(self.file_path(file_id)) {
            Ok(file) => file.sync_all()?,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    pub fn current_file(&self) -> Result<u32, FlatFileError> {
        let state = self.state.lock().map_err(|_| FlatFileError::Poisoned)?;
        Ok(state.current_file)
    }

    pub fn open_file(&self, file_id: u32) -> Result<Option<File>, FlatFileError> {
        match File::open(self.file_path(file_id)) {
            Ok(file) => Ok(Some(file)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn file_path(&self, file_id: u32) -> PathBuf {
        self.dir.join(numbered_file_name(&self.prefix, file_id))
    }

    fn locate_active_file(
        dir: &Path,
        prefix: &str,
        max_file_size: u64,
    ) -> Result<(u32, u64), FlatFileError> {
        let mut file_id = 0u32;
        let mut last_existing: Option<(u32, u64)> = None;
        loop {
            let path = dir.join(numbered_file_name(prefix, file_id));
            if !path.exists() {
                break;
            }
            let metadata = std::fs::metadata(&path)?;
            last_existing = Some((file_id, metadata.len()));
            file_id += 1;
        }

        match last_existing {
            Some((last_id, len)) => {
                if len >= max_file_size {
                    Ok((last_id + 1, 0))
                } else {
                    Ok((last_id, len))
                }
            }
            None => Ok((0, 0)),
        }
    }
}

pub fn numbered_file_name(prefix: &str, file_id: u32) -> String {
    format!("{prefix}{file_id:05}.dat")
}

/// Walks an arbitrary byte stream for magic-framed records.
///
/// Bytes before a magic are skipped. A frame whose length exceeds [`MAX_RECORD_LEN`] is
/// skipped too and scanning resumes right after its magic. A frame cut short by end of
/// input ends the scan.
pub struct RecordScanner<R> {
    reader: BufReader<R>,
    magic: [u8; 4],
    /// Bytes handed back for a rescan, read before the underlying reader.
    pending: VecDeque<u8>,
    offset: u64,
    skipped: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScannedRecord {
    /// Offset of the frame's magic within the stream.
    pub offset: u64,
    pub payload: Vec<u8>,
}

impl<R: Read> RecordScanner<R> {
    pub fn new(reader: R, magic: [u8; 4]) -> Self {
        Self {
            reader: BufReader::new(reader),
            magic,
            pending: VecDeque::new(),
            offset: 0,
            skipped: 0,
        }
    }

    /// Number of bytes discarded while hunting for a magic.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    pub fn next_record(&mut self) -> Result<Option<ScannedRecord>, FlatFileError> {
        loop {
            let Some(frame_offset) = self.seek_magic()? else {
                return Ok(None);
            };
            let mut len_bytes = [0u8; 4];
            if !self.read_full(&mut len_bytes)? {
                return Ok(None);
            }
            let len = u32::from_le_bytes(len_bytes);
            if len == 0 || len > MAX_RECORD_LEN {
                // The length bytes may hold the start of the next magic.
                self.skipped += self.magic.len() as u64;
                self.unread(&len_bytes);
                continue;
            }
            let mut payload = vec![0u8; len as usize];
            if !self.read_full(&mut payload)? {
                return Ok(None);
            }
            return Ok(Some(ScannedRecord {
                offset: frame_offset,
                payload,
            }));
        }
    }

    fn seek_magic(&mut self) -> Result<Option<u64>, FlatFileError> {
        let mut window = [0u8; 4];
        let mut filled = 0usize;
        loop {
            let Some(byte) = self.read_byte()? else {
                self.skipped += filled as u64;
                return Ok(None);
            };
            self.offset += 1;
            if filled < 4 {
                window[filled] = byte;
                filled += 1;
            } else {
                window.rotate_left(1);
                window[3] = byte;
                self.skipped += 1;
            }
            if filled == 4 && window == self.magic {
                return Ok(Some(self.offset - 4));
            }
        }
    }

    fn read_byte(&mut self) -> Result<Option<u8>, FlatFileError> {
        if let Some(byte) = self.pending.pop_front() {
            return Ok(Some(byte));
        }
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn unread(&mut self, bytes: &[u8]) {
        for byte in bytes.iter().rev() {
            self.pending.push_front(*byte);
        }
        self.offset -= bytes.len() as u64;
    }

    fn read_full(&mut self, buf: &mut [u8]) -> Result<bool, FlatFileError> {
        let from_pending = self.pending.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..from_pending)) {
            *slot = byte;
        }
        match self.reader.read_exact(&mut buf[from_pending..]) {
            Ok(()) => {
                self.offset += buf.len() as u64;
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
