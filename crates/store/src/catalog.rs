use std::collections::HashMap;
use std::path::{Path, PathBuf};

use proto::{CatalogError, ChallengeId};
use serde::Deserialize;
use tracing::{debug, info, warn};

const MANIFEST_NAME: &str = "challenge.yaml";
const VALIDATE_SCRIPT: &str = "validate.sh";
const SETUP_SCRIPT: &str = "setup.sh";

#[derive(Debug, Deserialize)]
struct ChallengeManifest {
    id: ChallengeId,
    title: String,
    #[serde(default = "default_points")]
    points: i64,
}

fn default_points() -> i64 {
    100
}

/// One loaded challenge: its manifest fields plus the absolute directory
/// that gets bind-mounted into containers.
#[derive(Debug, Clone)]
pub struct ChallengeMeta {
    pub id: ChallengeId,
    pub title: String,
    pub points: i64,
    pub dir: PathBuf,
}

impl ChallengeMeta {
    /// Path of the required validation script.
    pub fn validate_script(&self) -> PathBuf {
        self.dir.join(VALIDATE_SCRIPT)
    }

    /// Path of the optional setup script.
    pub fn setup_script(&self) -> PathBuf {
        self.dir.join(SETUP_SCRIPT)
    }
}

/// Loads challenge manifests from a challenges root directory.
///
/// Each subdirectory containing a `challenge.yaml` is one challenge; the
/// directory must also carry `validate.sh`. Directories without a manifest
/// are ignored.
#[derive(Debug)]
pub struct ChallengeCatalog {
    challenges: HashMap<ChallengeId, ChallengeMeta>,
}

impl ChallengeCatalog {
    /// Scan `root` and load every challenge manifest under it.
    pub async fn load(root: impl AsRef<Path>) -> Result<Self, CatalogError> {
        // Canonicalize so the directories handed to the container engine are
        // absolute; relative bind sources are rejected by the engine.
        let root = tokio::fs::canonicalize(root.as_ref()).await?;

        let mut challenges: HashMap<ChallengeId, ChallengeMeta> = HashMap::new();
        let mut entries = tokio::fs::read_dir(&root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }

            let manifest_path = dir.join(MANIFEST_NAME);
            let raw = match tokio::fs::read_to_string(&manifest_path).await {
                Ok(raw) => raw,
                Err(_) => {
                    debug!("Skipping {} (no {MANIFEST_NAME})", dir.display());
                    continue;
                }
            };

            let manifest: ChallengeManifest =
                serde_yaml::from_str(&raw).map_err(|e| CatalogError::Manifest {
                    path: manifest_path.display().to_string(),
                    reason: e.to_string(),
                })?;

            if !dir.join(VALIDATE_SCRIPT).is_file() {
                return Err(CatalogError::MissingValidate(dir.display().to_string()));
            }

            let meta = ChallengeMeta {
                id: manifest.id,
                title: manifest.title,
                points: manifest.points,
                dir: dir.clone(),
            };

            if challenges.insert(manifest.id, meta).is_some() {
                return Err(CatalogError::Duplicate(manifest.id));
            }
        }

        if challenges.is_empty() {
            warn!("Challenge catalog at {} is empty", root.display());
        } else {
            info!(
                "Loaded {} challenge(s) from {}",
                challenges.len(),
                root.display()
            );
        }

        Ok(Self { challenges })
    }

    /// Absolute directory for a challenge id.
    pub fn dir(&self, id: ChallengeId) -> Result<&Path, CatalogError> {
        self.challenges
            .get(&id)
            .map(|c| c.dir.as_path())
            .ok_or(CatalogError::NotFound(id))
    }

    /// Points awarded for the first solve of a challenge.
    pub fn points(&self, id: ChallengeId) -> Result<i64, CatalogError> {
        self.challenges
            .get(&id)
            .map(|c| c.points)
            .ok_or(CatalogError::NotFound(id))
    }

    /// Full metadata for a challenge id.
    pub fn get(&self, id: ChallengeId) -> Option<&ChallengeMeta> {
        self.challenges.get(&id)
    }

    /// Number of loaded challenges.
    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    /// Whether the catalog holds no challenges.
    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_challenge(root: &Path, dir_name: &str, id: i64, points: Option<i64>) {
        let dir = root.join(dir_name);
        std::fs::create_dir_all(&dir).expect("create challenge dir");
        let points_line = points.map(|p| format!("points: {p}\n")).unwrap_or_default();
        std::fs::write(
            dir.join(MANIFEST_NAME),
            format!("id: {id}\ntitle: \"Challenge {id}\"\n{points_line}"),
        )
        .expect("write manifest");
        std::fs::write(dir.join(VALIDATE_SCRIPT), "#!/bin/bash\nexit 0\n")
            .expect("write validate.sh");
    }

    #[tokio::test]
    async fn loads_challenges_and_resolves_dirs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_challenge(tmp.path(), "file-hunt", 1, Some(100));
        write_challenge(tmp.path(), "proc-sleuth", 2, None);

        let catalog = ChallengeCatalog::load(tmp.path()).await.expect("load");

        assert_eq!(catalog.len(), 2);
        let dir = catalog.dir(1).expect("dir");
        assert!(dir.is_absolute());
        assert!(dir.ends_with("file-hunt"));
        assert_eq!(catalog.points(1).expect("points"), 100);
        assert_eq!(catalog.points(2).expect("default points"), 100);
        assert_eq!(catalog.get(2).expect("meta").title, "Challenge 2");
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_challenge(tmp.path(), "only", 1, None);

        let catalog = ChallengeCatalog::load(tmp.path()).await.expect("load");

        assert!(matches!(catalog.dir(99), Err(CatalogError::NotFound(99))));
        assert!(matches!(catalog.points(99), Err(CatalogError::NotFound(99))));
    }

    #[tokio::test]
    async fn directory_without_manifest_is_ignored() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_challenge(tmp.path(), "real", 1, None);
        std::fs::create_dir_all(tmp.path().join("assets")).expect("plain dir");

        let catalog = ChallengeCatalog::load(tmp.path()).await.expect("load");
        assert_eq!(catalog.len(), 1);
    }

    #[tokio::test]
    async fn missing_validate_script_fails_load() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("broken");
        std::fs::create_dir_all(&dir).expect("dir");
        std::fs::write(dir.join(MANIFEST_NAME), "id: 1\ntitle: \"Broken\"\n")
            .expect("manifest");

        let err = ChallengeCatalog::load(tmp.path())
            .await
            .expect_err("load should fail");
        assert!(matches!(err, CatalogError::MissingValidate(_)));
    }

    #[tokio::test]
    async fn duplicate_ids_fail_load() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_challenge(tmp.path(), "one", 7, None);
        write_challenge(tmp.path(), "two", 7, None);

        let err = ChallengeCatalog::load(tmp.path())
            .await
            .expect_err("load should fail");
        assert!(matches!(err, CatalogError::Duplicate(7)));
    }

    #[tokio::test]
    async fn bad_yaml_reports_manifest_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("bad");
        std::fs::create_dir_all(&dir).expect("dir");
        std::fs::write(dir.join(MANIFEST_NAME), "id: [not an id\n").expect("manifest");
        std::fs::write(dir.join(VALIDATE_SCRIPT), "#!/bin/bash\n").expect("validate");

        let err = ChallengeCatalog::load(tmp.path())
            .await
            .expect_err("load should fail");
        assert!(matches!(err, CatalogError::Manifest { .. }));
    }
}
