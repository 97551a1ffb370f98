//! Storage target resolution and repository opening.

use std::path::PathBuf;

use trellis_core::error::{Result, TrellisError};
use trellis_core::repo::Repository;
use trellis_core::TrellisConfig;
use trellis_object::{FsObjectStore, ObjectRepository};
use trellis_sqlite::{EngineVersion, SqliteRepository};

/// Resolved storage target from a datastore URI or bare path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    Sqlite { path: String },
    Object { root: PathBuf, uri: String },
}

impl StorageTarget {
    pub fn backend(&self) -> &'static str {
        match self {
            StorageTarget::Sqlite { .. } => "sqlite",
            StorageTarget::Object { .. } => "object",
        }
    }
}

/// Parse a datastore URI. Accepted forms: `sqlite:///path`, `:memory:`,
/// bare filesystem paths (legacy sqlite binding), and `file:///dir` for
/// the object-store backend. `s3://` targets are recognised but require
/// an S3 client, which this build does not carry.
pub fn parse_storage_target(uri: &str) -> Result<StorageTarget> {
    if uri == ":memory:" {
        return Ok(StorageTarget::Sqlite {
            path: ":memory:".to_string(),
        });
    }

    if let Some(rest) = uri.strip_prefix("sqlite://") {
        let mut path = rest.to_string();
        if path.starts_with("//") {
            // sqlite:////abs/path -> /abs/path
            path = path[1..].to_string();
        }
        if path == "/:memory:" {
            path = ":memory:".to_string();
        }
        if path.is_empty() {
            return Err(TrellisError::storage(
                "parse_storage_uri",
                format!("invalid sqlite URI '{uri}'"),
            ));
        }
        return Ok(StorageTarget::Sqlite { path });
    }

    if let Some(rest) = uri.strip_prefix("file://") {
        if rest.is_empty() {
            return Err(TrellisError::storage(
                "parse_storage_uri",
                format!("invalid file URI '{uri}'"),
            ));
        }
        return Ok(StorageTarget::Object {
            root: PathBuf::from(rest),
            uri: uri.to_string(),
        });
    }

    if uri.starts_with("s3://") {
        return Err(TrellisError::storage(
            "parse_storage_uri",
            "s3 object-store targets require an S3 client; \
             this build supports file:// object stores",
        ));
    }

    if let Some((scheme, _)) = uri.split_once("://") {
        return Err(TrellisError::storage(
            "parse_storage_uri",
            format!("unsupported storage URI scheme '{scheme}' for '{uri}'"),
        ));
    }

    // Bare path: legacy sqlite binding.
    Ok(StorageTarget::Sqlite {
        path: uri.to_string(),
    })
}

/// Open a backend repository from a datastore URI, detecting the engine
/// version unless one is forced.
pub fn open_repository(
    uri: &str,
    config: &TrellisConfig,
    engine_version: Option<&str>,
) -> Result<Box<dyn Repository>> {
    match parse_storage_target(uri)? {
        StorageTarget::Sqlite { path } => {
            let engine = engine_version.map(EngineVersion::parse).transpose()?;
            Ok(Box::new(SqliteRepository::open(
                &path,
                config.clone(),
                engine,
            )?))
        }
        StorageTarget::Object { root, uri } => {
            let store = FsObjectStore::open(root)?;
            Ok(Box::new(ObjectRepository::open(
                Box::new(store),
                &uri,
                config.clone(),
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_uri_forms() {
        assert_eq!(
            parse_storage_target("sqlite:///data/onto.db").unwrap(),
            StorageTarget::Sqlite {
                path: "/data/onto.db".to_string()
            }
        );
        assert_eq!(
            parse_storage_target("sqlite:////abs/onto.db").unwrap(),
            StorageTarget::Sqlite {
                path: "/abs/onto.db".to_string()
            }
        );
        assert_eq!(
            parse_storage_target("sqlite:///:memory:").unwrap(),
            StorageTarget::Sqlite {
                path: ":memory:".to_string()
            }
        );
        assert_eq!(
            parse_storage_target(":memory:").unwrap(),
            StorageTarget::Sqlite {
                path: ":memory:".to_string()
            }
        );
        assert_eq!(
            parse_storage_target("onto.db").unwrap(),
            StorageTarget::Sqlite {
                path: "onto.db".to_string()
            }
        );
    }

    #[test]
    fn test_object_uri() {
        let target = parse_storage_target("file:///var/data/onto").unwrap();
        assert_eq!(target.backend(), "object");
    }

    #[test]
    fn test_rejected_schemes() {
        assert!(parse_storage_target("s3://bucket/prefix").is_err());
        assert!(parse_storage_target("http://host/x").is_err());
        assert!(parse_storage_target("sqlite://").is_err());
    }
}
