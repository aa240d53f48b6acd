//! Name to library mapping, built once at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use super::{FileSystemLibrary, Library, LibraryError, LibraryResult, SqliteLibrary};
use crate::config::{LibraryBackend, LibraryConfig};

/// Immutable set of named libraries
#[derive(Debug, Default, Clone)]
pub struct Registry {
    libraries: BTreeMap<String, Arc<dyn Library>>,
}

impl Registry {
    /// Build from library instances; names must be unique
    pub fn new(libraries: impl IntoIterator<Item = Arc<dyn Library>>) -> LibraryResult<Self> {
        let mut map = BTreeMap::new();
        for library in libraries {
            let name = library.name().to_string();
            if map.insert(name.clone(), library).is_some() {
                return Err(LibraryError::DuplicateLibrary(name));
            }
        }
        Ok(Self { libraries: map })
    }

    /// Open every configured backend
    pub async fn from_config(configs: &[LibraryConfig]) -> LibraryResult<Self> {
        let mut libraries: Vec<Arc<dyn Library>> = Vec::with_capacity(configs.len());
        for config in configs {
            libraries.push(open_library(config).await?);
        }

        let registry = Self::new(libraries)?;
        info!(libraries = ?registry.names().collect::<Vec<_>>(), "Registry ready");
        Ok(registry)
    }

    pub fn lookup(&self, name: &str) -> LibraryResult<Arc<dyn Library>> {
        self.libraries
            .get(name)
            .cloned()
            .ok_or_else(|| LibraryError::UnknownLibrary(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.libraries.keys().map(String::as_str)
    }
}

async fn open_library(config: &LibraryConfig) -> LibraryResult<Arc<dyn Library>> {
    let library: Arc<dyn Library> = match &config.backend {
        LibraryBackend::Filesystem { root } => {
            Arc::new(FileSystemLibrary::open(&config.name, root).await?)
        }
        LibraryBackend::Sqlite { root } => Arc::new(SqliteLibrary::open(&config.name, root).await?),
        #[cfg(feature = "aws")]
        LibraryBackend::Aws {
            bucket,
            table,
            region,
            endpoint_url,
            entry_ttl_days,
        } => Arc::new(
            super::AwsLibrary::connect(
                &config.name,
                bucket,
                table,
                region.as_deref(),
                endpoint_url.as_deref(),
                *entry_ttl_days,
            )
            .await,
        ),
        #[cfg(not(feature = "aws"))]
        LibraryBackend::Aws { .. } => {
            return Err(LibraryError::Unavailable(format!(
                "library '{}' needs the `aws` feature",
                config.name
            )))
        }
    };
    Ok(library)
}
