//! On-disk cache of exposure tables, addressed by codec names.
use std::fs;
use std::path::{Path, PathBuf};

use polars::prelude::*;

use crate::codec::{self, ChunkInfo, ARTIFACT_EXTENSION};
use crate::config::Config;
use crate::error::Result;
use crate::model::{ExposureModel, FacId, Geounit};
use crate::table::{read_parquet, FirmGroups};

/// Receptor radius an artifact was computed with. Alternate-radius artifacts
/// live in mirror roots so the two never overwrite each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Radius {
    #[default]
    Default,
    Alternate,
}

impl Radius {
    pub fn from_flag(alt: bool) -> Self {
        if alt {
            Radius::Alternate
        } else {
            Radius::Default
        }
    }

    pub fn is_alternate(&self) -> bool {
        *self == Radius::Alternate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageVariant {
    Primary,
    Chunked,
}

/// Identity of one per-facility (or per-chunk) raw exposure artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub geounit: Geounit,
    pub model: ExposureModel,
    pub facid: FacId,
    pub chunk: Option<ChunkInfo>,
}

impl ArtifactKey {
    pub fn new(
        geounit: Geounit,
        model: ExposureModel,
        facid: FacId,
        chunk: Option<ChunkInfo>,
    ) -> Self {
        Self {
            geounit,
            model,
            facid,
            chunk,
        }
    }

    pub fn variant(&self) -> StorageVariant {
        match self.chunk {
            Some(_) => StorageVariant::Chunked,
            None => StorageVariant::Primary,
        }
    }

    pub fn file_name(&self) -> Result<String> {
        codec::file_name(self.geounit, self.model, self.facid, self.chunk)
    }

    /// The same artifact under the facility's group representative, the id
    /// every stored table is filed by.
    pub fn grouped(self, groups: &FirmGroups) -> Self {
        Self {
            facid: groups.representative(self.facid),
            ..self
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    primary: PathBuf,
    chunks: PathBuf,
    alt_suffix: String,
}

impl CacheStore {
    pub fn new(primary: &Path, chunks: &Path, alt_suffix: &str) -> Self {
        Self {
            primary: primary.to_path_buf(),
            chunks: chunks.to_path_buf(),
            alt_suffix: alt_suffix.to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.storage.primary,
            config.get_chunk_root(),
            &config.storage.alt_radius_suffix,
        )
    }

    pub fn root(&self, variant: StorageVariant, radius: Radius) -> PathBuf {
        let root = match variant {
            StorageVariant::Primary => &self.primary,
            StorageVariant::Chunked => &self.chunks,
        };
        match radius {
            Radius::Default => root.clone(),
            Radius::Alternate => {
                let name = root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                root.with_file_name(format!("{name}{}", self.alt_suffix))
            }
        }
    }

    pub fn path_for(&self, key: &ArtifactKey, radius: Radius) -> Result<PathBuf> {
        Ok(self.root(key.variant(), radius).join(key.file_name()?))
    }

    /// Path for a non-artifact table (aggregate panels, unit counts) in the primary root.
    pub fn table_path(&self, stem: &str) -> PathBuf {
        self.primary.join(format!("{stem}.{ARTIFACT_EXTENSION}"))
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    pub fn read(&self, path: &Path) -> Result<DataFrame> {
        read_parquet(path)
    }

    pub fn try_read(&self, path: &Path) -> Result<Option<DataFrame>> {
        if self.exists(path) {
            self.read(path).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Writes next to the target and renames into place, so a reader never
    /// sees a half-written table under the final name.
    pub fn write(&self, path: &Path, frame: &mut DataFrame) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension(format!("{ARTIFACT_EXTENSION}.tmp"));
        {
            let mut file = fs::File::create(&tmp_path)?;
            ParquetWriter::new(&mut file).finish(frame)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Paths matching a glob `pattern`, sorted.
    pub fn enumerate(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = glob::glob(pattern)?.filter_map(|p| p.ok()).collect();
        paths.sort();
        Ok(paths)
    }

    /// Glob pattern for every chunk artifact of `(geounit, model)`.
    pub fn chunk_pattern(
        &self,
        geounit: Geounit,
        model: ExposureModel,
        radius: Radius,
    ) -> Result<String> {
        let root = self.root(StorageVariant::Chunked, radius);
        let root = glob::Pattern::escape(&root.to_string_lossy());
        let prefix = codec::model_prefix(geounit, model);
        Ok(format!("{root}/{prefix}*c*.{ARTIFACT_EXTENSION}"))
    }

    /// Deletes `path`, returning the number of bytes freed.
    pub fn remove(&self, path: &Path) -> Result<u64> {
        let bytes = fs::metadata(path)?.len();
        fs::remove_file(path)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AirqError;

    fn frame() -> DataFrame {
        [
            Series::new("utm_east".into(), [1i32, 2]),
            Series::new("q1".into(), [0.5f32, 0.25]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn chunked_and_alternate_roots() {
        let store = CacheStore::new(Path::new("/d/airq"), Path::new("/s/airq"), "30");
        let whole = ArtifactKey::new(Geounit::House, ExposureModel::Dispersion, 20, None);
        let chunk = ArtifactKey::new(
            Geounit::House,
            ExposureModel::Dispersion,
            20,
            Some(ChunkInfo::new(1, 2).unwrap()),
        );
        assert_eq!(
            store.path_for(&whole, Radius::Default).unwrap(),
            PathBuf::from("/d/airq/hA20.parquet")
        );
        assert_eq!(
            store.path_for(&chunk, Radius::Default).unwrap(),
            PathBuf::from("/s/airq/hA20c12.parquet")
        );
        assert_eq!(
            store.path_for(&whole, Radius::Alternate).unwrap(),
            PathBuf::from("/d/airq30/hA20.parquet")
        );
        assert_eq!(
            store.path_for(&chunk, Radius::Alternate).unwrap(),
            PathBuf::from("/s/airq30/hA20c12.parquet")
        );
    }

    #[test]
    fn grouped_keys_use_the_representative() {
        let groups = FirmGroups::from_pairs([(5, 7)]);
        let key = ArtifactKey::new(Geounit::Block, ExposureModel::Dispersion, 5, None);
        assert_eq!(key.grouped(&groups).facid, 7);
        assert_eq!(key.grouped(&groups).file_name().unwrap(), "bA7.parquet");
        let other = ArtifactKey { facid: 9, ..key };
        assert_eq!(other.grouped(&groups), other);
    }

    #[test]
    fn write_read_enumerate() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(&dir.path().join("airq"), &dir.path().join("chunks"), "30");
        let model = ExposureModel::Dispersion;

        let key = ArtifactKey::new(Geounit::Grid, model, 5, Some(ChunkInfo::new(2, 3).unwrap()));
        let path = store.path_for(&key, Radius::Default).unwrap();
        assert!(!store.exists(&path));
        assert!(matches!(store.read(&path), Err(AirqError::MissingArtifact(_))));
        assert!(store.try_read(&path).unwrap().is_none());

        let mut df = frame();
        store.write(&path, &mut df).unwrap();
        assert!(store.exists(&path));
        assert!(!path.with_extension("parquet.tmp").exists());
        assert!(store.read(&path).unwrap().equals(&df));

        let other = ArtifactKey::new(Geounit::House, model, 5, Some(ChunkInfo::new(1, 3).unwrap()));
        store
            .write(&store.path_for(&other, Radius::Default).unwrap(), &mut df)
            .unwrap();

        let pattern = store.chunk_pattern(Geounit::Grid, model, Radius::Default).unwrap();
        assert_eq!(store.enumerate(&pattern).unwrap(), vec![path.clone()]);

        assert!(store.remove(&path).unwrap() > 0);
        assert!(store.enumerate(&pattern).unwrap().is_empty());
    }
}
