use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Commit;

/// Encode one commit as `[len][bincode][crc32]`.
fn encode_commit(writer: &mut impl Write, commit: &Commit) -> io::Result<()> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "commit record too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only write-ahead log of committed transactions.
///
/// Format per entry: `[u32: len][bincode: Commit][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Every transaction is exactly one entry, so a torn tail loses the whole
///   transaction and never half of one.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync a single commit. Tests only; the engine batches
    /// through `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, commit: &Commit) -> io::Result<()> {
        self.append_buffered(commit)?;
        self.flush_sync()
    }

    /// Buffer a commit without flushing. `flush_sync()` makes the batch durable.
    pub fn append_buffered(&mut self, commit: &Commit) -> io::Result<()> {
        encode_commit(&mut self.writer, commit)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a compacted log to a temp file next to the WAL and fsync it.
    pub fn write_compact_file(path: &Path, commits: &[Commit]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for commit in commits {
            encode_commit(&mut writer, commit)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the temp file over the WAL and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, commits: &[Commit]) -> io::Result<()> {
        Self::write_compact_file(&self.path, commits)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning every intact commit.
    /// Reading stops at the first truncated or corrupt entry, and the file
    /// is cut back to the last intact one so later appends stay readable.
    pub fn replay(path: &Path) -> io::Result<Vec<Commit>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut commits = Vec::new();
        let mut valid_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Commit>(&payload) {
                Ok(commit) => commits.push(commit),
                Err(_) => break,
            }
            valid_len += 8 + len as u64;
        }

        if valid_len < file_len {
            tracing::warn!(
                "WAL {} has {} trailing bytes past the last intact commit; truncating",
                path.display(),
                file_len - valid_len
            );
            OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
        }
        Ok(commits)
    }
}
