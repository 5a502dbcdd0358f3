use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use seq_io::fastq::{Reader as FastqReader, Record};

use crate::utils::file::open_reader;

/// Counts the number of records in a (possibly gzipped) FASTQ.
///
/// # Arguments
///
/// * `path` - Valid path to a fastq file.
///
/// # Returns
/// u64: Number of records in the FASTQ.
///
pub fn record_counter(path: &Path) -> Result<u64> {
    let reader = open_reader(path).map_err(|e| anyhow!("Cannot open {}: {}", path.display(), e))?;
    let mut fastq = FastqReader::new(reader);
    let mut counter = 0u64;
    while let Some(record) = fastq.next() {
        let record = record.map_err(|e| anyhow!("Malformed FASTQ {}: {}", path.display(), e))?;
        if record.seq().len() != record.qual().len() {
            return Err(anyhow!(
                "Malformed FASTQ {}: sequence/quality length mismatch at record {}",
                path.display(),
                counter + 1
            ));
        }
        counter += 1;
    }
    Ok(counter)
}

/// Async wrapper that moves the count off the runtime threads.
pub async fn count_reads(path: PathBuf) -> Result<u64> {
    tokio::task::spawn_blocking(move || record_counter(&path)).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use crate::utils::file::gzip_file;

    fn fastq_text(n: usize) -> String {
        (0..n)
            .map(|i| format!("@read{}\nACGTACGT\n+\nIIIIIIII\n", i))
            .collect()
    }

    #[tokio::test]
    async fn test_count_gzipped_reads() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let plain = dir.path().join("S1.fastq");
        let gz = dir.path().join("S1.fastq.1.gz");
        fs::write(&plain, fastq_text(25))?;
        gzip_file(&plain, &gz)?;
        assert_eq!(count_reads(gz).await?, 25);
        Ok(())
    }

    #[test]
    fn test_count_empty_and_malformed() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let empty = dir.path().join("empty.fastq");
        fs::write(&empty, "")?;
        assert_eq!(record_counter(&empty)?, 0);

        let bad = dir.path().join("bad.fastq");
        fs::write(&bad, "@r1\nACGT\n+\nII\n")?;
        assert!(record_counter(&bad).is_err());
        Ok(())
    }
}
