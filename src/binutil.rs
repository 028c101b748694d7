use derive_more::*;
use directories::ProjectDirs;
use std::{fmt::Display, path::PathBuf};

#[derive(Clone, Debug, Deref, DerefMut, FromStr)]
pub struct RewindDataDir(pub PathBuf);

impl RewindDataDir {
    pub fn chain_data_dir(&self) -> PathBuf {
        self.0.join("chaindata.redb")
    }
}

impl Default for RewindDataDir {
    fn default() -> Self {
        Self(
            ProjectDirs::from("", "", "Rewind")
                .map(|pd| pd.data_dir().to_path_buf())
                .unwrap_or_else(|| "data".into()),
        )
    }
}

impl Display for RewindDataDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}
