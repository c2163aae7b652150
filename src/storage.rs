use crate::error::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

const MAP_INFOS_FILE: &str = "map_infos.json";
const TILES_DIR: &str = "tiles";
const TILE_EXTENSION: &str = "pbf";

/// Deepest zoom level a tile address may carry
pub const MAX_TILE_ZOOM: u8 = 30;

/// Metadata describing the map held by a database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapInfos {
    pub region: String,
    pub index_time: DateTime<Utc>,
    #[serde(default)]
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub center_lat: f64,
    pub center_lng: f64,
}

impl MapInfos {
    /// `"<region> <index time>"`, used to label the data version metric
    pub fn data_version(&self) -> String {
        format!(
            "{} {}",
            self.region,
            self.index_time.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// Address of a tile in the XYZ scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Whether `x` and `y` fall inside the `2^z` grid
    pub fn is_valid(&self) -> bool {
        if self.z > MAX_TILE_ZOOM {
            return false;
        }
        let side = 1u64 << self.z;
        (self.x as u64) < side && (self.y as u64) < side
    }
}

/// Read-only access to a map database.
///
/// Shared across every request handler; implementations must allow
/// concurrent reads and never mutate the underlying store.
#[async_trait]
pub trait MapStorage: Send + Sync {
    /// `Ok(None)` when the database holds no map
    async fn load_map_infos(&self) -> Result<Option<MapInfos>, StorageError>;

    /// `Ok(None)` when the tile is not part of the map
    async fn read_tile(&self, tile: TileCoord) -> Result<Option<Bytes>, StorageError>;
}

/// Map database laid out as a directory:
///
/// ```text
/// map.db/
///   map_infos.json
///   tiles/{z}/{x}/{y}.pbf
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    /// Open an existing database without ever writing to it
    pub async fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let root = path.as_ref().to_path_buf();

        let metadata = fs::metadata(&root).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound { path: root.clone() },
            _ => StorageError::Io {
                path: root.clone(),
                source: e,
            },
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::NotADirectory { path: root });
        }

        info!("Opened map database read-only: {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tile_path(&self, tile: TileCoord) -> PathBuf {
        self.root
            .join(TILES_DIR)
            .join(tile.z.to_string())
            .join(tile.x.to_string())
            .join(format!("{}.{}", tile.y, TILE_EXTENSION))
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[async_trait]
impl MapStorage for DirectoryStorage {
    async fn load_map_infos(&self) -> Result<Option<MapInfos>, StorageError> {
        let path = self.root.join(MAP_INFOS_FILE);

        let Some(data) = read_optional(&path).await? else {
            debug!("No {} in {}", MAP_INFOS_FILE, self.root.display());
            return Ok(None);
        };

        let infos: MapInfos = serde_json::from_slice(&data)?;
        Ok(Some(infos))
    }

    async fn read_tile(&self, tile: TileCoord) -> Result<Option<Bytes>, StorageError> {
        let data = read_optional(&self.tile_path(tile)).await?;
        Ok(data.map(Bytes::from))
    }
}
