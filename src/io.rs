use std::path::Path;
use anyhow::bail;
use tokio::fs::{create_dir_all, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};

pub async fn prepare_io(dir: &Path) -> anyhow::Result<()> {
    create_dir_all(dir).await?;
    Ok(())
}

/// Overwrites `path`, creating missing parent directories.
pub async fn write_io_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent).await?;
        }
    }
    let mut writer = BufWriter::new(File::create(path).await?);
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_io_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    if !path.exists() {
        bail!("Tried to read nonexistent file {}!", path.display())
    }
    let mut bytes = Vec::new();
    BufReader::new(File::open(path).await?).read_to_end(&mut bytes).await?;
    Ok(bytes)
}
