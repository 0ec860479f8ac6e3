use std::path::PathBuf;

use anyhow::Result;

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("TUNEDCHAT_DATA_DIR") {
        return Ok(PathBuf::from(p));
    }
    // Dev default: repo-root/tmp/tunedchat-data
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    Ok(root.join("tmp").join("tunedchat-data"))
}
