use crate::platform::Platform;
use crate::rebase::{rebase_image, AppImage};
use crate::{ImageRole, RebaseError, SaveFailure};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strata_image::{ensure_single_registry, registry_of, ImageRef, ImageStore, Target};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failure to produce or write a [`RebaseReport`].
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write report {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What to rebase and where to write it.
#[derive(Debug, Clone)]
pub struct RebaseRequest {
    /// Image names; the first is both the source and the primary destination.
    pub images: Vec<String>,
    /// Base to rebase onto. Chosen from the app's stack metadata when absent.
    pub run_image: Option<String>,
    pub target: Target,
}

/// One name the rebased image was written under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedImage {
    pub name: String,
    pub digest: String,
}

/// Summary of a successful rebase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebaseReport {
    pub app_image: String,
    pub run_image: String,
    pub run_image_reference: String,
    pub previous_top_layer: String,
    pub new_top_layer: String,
    pub replaced_layers: usize,
    pub base_layers: usize,
    pub app_layers: usize,
    pub target: String,
    pub platform_api: String,
    pub rebased_at: String,
    pub saved: Vec<SavedImage>,
}

impl RebaseReport {
    pub fn to_toml(&self) -> Result<String, ReportError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn write_toml(&self, path: &Path) -> Result<(), ReportError> {
        let content = self.to_toml()?;
        let write_err = |source| ReportError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(write_err)?;
            }
        }
        std::fs::write(path, content).map_err(write_err)
    }
}

/// Runs rebases against one image store under one platform API.
pub struct Rebaser<'a> {
    store: &'a dyn ImageStore,
    platform: &'a Platform,
}

impl<'a> Rebaser<'a> {
    pub fn new(store: &'a dyn ImageStore, platform: &'a Platform) -> Self {
        Self { store, platform }
    }

    /// Rebase `request.images[0]` and save it under every requested name.
    ///
    /// All names are validated and both images resolved before anything is
    /// written. Every name is attempted even after one fails to save.
    pub fn run(&self, request: &RebaseRequest) -> Result<RebaseReport, RebaseError> {
        let registry = self.validate_names(request)?;
        let primary = &request.images[0];

        info!("rebasing {primary}");
        let app_image = self
            .store
            .open(primary)
            .map_err(|source| RebaseError::ImageAccess {
                role: ImageRole::App,
                reference: primary.clone(),
                source,
            })?;
        let app = AppImage::new(&app_image)?;

        let run_image = match &request.run_image {
            Some(explicit) => explicit.clone(),
            None => {
                let stack = &app.metadata().stack;
                stack.best_run_image_mirror(&registry).ok_or_else(|| {
                    RebaseError::InvalidArgs(
                        "a run image reference is required when no stack metadata is available"
                            .to_owned(),
                    )
                })?
            }
        };
        debug!("using run image {run_image}");

        let base = self
            .store
            .open(&run_image)
            .map_err(|source| RebaseError::ImageAccess {
                role: ImageRole::Base,
                reference: run_image.clone(),
                source,
            })?;

        let rebased = rebase_image(&app, &base, &run_image, self.platform)?;

        let mut saved = Vec::new();
        let mut failed = Vec::new();
        for name in &request.images {
            match self.store.save(&rebased.image, name) {
                Ok(digest) => {
                    info!("saved {name}");
                    saved.push(SavedImage {
                        name: name.clone(),
                        digest: digest.into_inner(),
                    });
                }
                Err(e) => {
                    warn!("failed to save {name}: {e}");
                    failed.push((name.clone(), e.to_string()));
                }
            }
        }
        if !failed.is_empty() {
            return Err(RebaseError::Save(SaveFailure {
                failed,
                saved: saved.into_iter().map(|s| s.name).collect(),
            }));
        }

        Ok(RebaseReport {
            app_image: primary.clone(),
            run_image,
            run_image_reference: rebased.base_reference,
            previous_top_layer: rebased.previous_top_layer.into_inner(),
            new_top_layer: rebased.new_top_layer.into_inner(),
            replaced_layers: rebased.replaced_layers,
            base_layers: rebased.base_layers,
            app_layers: rebased.app_layers,
            target: request.target.to_string(),
            platform_api: self.platform.api().to_owned(),
            rebased_at: chrono::Utc::now().to_rfc3339(),
            saved,
        })
    }

    /// Check the names and return the registry used for mirror selection.
    fn validate_names(&self, request: &RebaseRequest) -> Result<String, RebaseError> {
        if request.images.is_empty() {
            return Err(RebaseError::InvalidArgs(
                "at least one image argument is required".to_owned(),
            ));
        }
        for name in &request.images {
            ImageRef::parse(name).map_err(|e| RebaseError::InvalidArgs(e.to_string()))?;
        }
        let registry = match request.target {
            Target::Registry => ensure_single_registry(&request.images),
            Target::Daemon => registry_of(&request.images[0]),
        };
        registry.map_err(|e| RebaseError::InvalidArgs(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Mutex;
    use strata_image::image::{ImageConfig, Layer, OCI_LAYER_MEDIA_TYPE};
    use strata_image::{DiffId, Digest, Image, ImageError, METADATA_LABEL};

    /// In-memory store recording every open and save.
    #[derive(Default)]
    struct MockStore {
        images: Mutex<HashMap<String, Image>>,
        fail_saves: BTreeSet<String>,
        opened: Mutex<Vec<String>>,
        saved: Mutex<Vec<String>>,
    }

    impl MockStore {
        fn insert(&self, name: &str, image: Image) {
            self.images.lock().unwrap().insert(name.to_owned(), image);
        }

        fn get(&self, name: &str) -> Option<Image> {
            self.images.lock().unwrap().get(name).cloned()
        }
    }

    impl ImageStore for MockStore {
        fn open(&self, reference: &str) -> Result<Image, ImageError> {
            self.opened.lock().unwrap().push(reference.to_owned());
            self.get(reference)
                .ok_or_else(|| ImageError::NotFound(reference.to_owned()))
        }

        fn save(&self, image: &Image, name: &str) -> Result<Digest, ImageError> {
            if self.fail_saves.contains(name) {
                return Err(ImageError::Http(format!("HTTP 500 for {name}")));
            }
            self.saved.lock().unwrap().push(name.to_owned());
            self.insert(name, image.clone());
            Ok(Digest::of(name.as_bytes()))
        }
    }

    fn layer(name: &str) -> Layer {
        Layer {
            digest: Digest::new(format!("sha256:{name}")),
            diff_id: DiffId::new(name),
            size: 1,
            media_type: OCI_LAYER_MEDIA_TYPE.to_owned(),
            source: None,
        }
    }

    fn image(layers: &[&str]) -> Image {
        Image::new(
            "img",
            ImageConfig::default(),
            layers.iter().map(|l| layer(l)).collect(),
        )
    }

    fn app_with_stack(run_image: &str, mirrors: &[&str]) -> Image {
        let mut app = image(&["B1", "B2", "A1", "A2"]);
        let label = serde_json::json!({
            "runImage": {"topLayer": "B2", "reference": "old"},
            "stack": {"runImage": {"image": run_image, "mirrors": mirrors}},
        });
        app.set_label(METADATA_LABEL, label.to_string());
        app
    }

    fn request(images: &[&str], run_image: Option<&str>, target: Target) -> RebaseRequest {
        RebaseRequest {
            images: images.iter().map(|s| (*s).to_owned()).collect(),
            run_image: run_image.map(str::to_owned),
            target,
        }
    }

    fn run(store: &MockStore, req: &RebaseRequest) -> Result<RebaseReport, RebaseError> {
        let platform = Platform::v06();
        Rebaser::new(store, &platform).run(req)
    }

    #[test]
    fn rebases_and_saves_primary() {
        let store = MockStore::default();
        store.insert("run.io/app:1", app_with_stack("run.io/stack:run", &[]));
        store.insert("run.io/stack:run", image(&["C1"]));

        let report = run(&store, &request(&["run.io/app:1"], None, Target::Registry)).unwrap();
        assert_eq!(report.run_image, "run.io/stack:run");
        assert_eq!(report.replaced_layers, 2);
        assert_eq!(report.previous_top_layer, "B2");
        assert_eq!(report.new_top_layer, "C1");
        assert_eq!(report.saved.len(), 1);
        assert_eq!(report.platform_api, "0.6");

        let saved = store.get("run.io/app:1").unwrap();
        let ids: Vec<String> = saved.diff_ids().into_iter().map(DiffId::into_inner).collect();
        assert_eq!(ids, vec!["C1", "A1", "A2"]);
    }

    #[test]
    fn picks_mirror_on_app_registry() {
        let store = MockStore::default();
        store.insert(
            "mirror.io/app:1",
            app_with_stack("run.io/stack:run", &["mirror.io/stack:run"]),
        );
        store.insert("mirror.io/stack:run", image(&["M1"]));

        let report = run(&store, &request(&["mirror.io/app:1"], None, Target::Registry)).unwrap();
        assert_eq!(report.run_image, "mirror.io/stack:run");
        assert_eq!(report.new_top_layer, "M1");
    }

    #[test]
    fn falls_back_to_stack_run_image() {
        let store = MockStore::default();
        store.insert(
            "other.io/app:1",
            app_with_stack("run.io/stack:run", &["mirror.io/stack:run"]),
        );
        store.insert("run.io/stack:run", image(&["C1"]));

        let report = run(&store, &request(&["other.io/app:1"], None, Target::Registry)).unwrap();
        assert_eq!(report.run_image, "run.io/stack:run");
    }

    #[test]
    fn explicit_run_image_is_used_verbatim() {
        let store = MockStore::default();
        store.insert("run.io/app:1", app_with_stack("run.io/stack:run", &[]));
        store.insert("elsewhere.io/custom:9", image(&["X1"]));

        let report = run(
            &store,
            &request(&["run.io/app:1"], Some("elsewhere.io/custom:9"), Target::Registry),
        )
        .unwrap();
        assert_eq!(report.run_image, "elsewhere.io/custom:9");
        assert!(!store
            .opened
            .lock()
            .unwrap()
            .contains(&"run.io/stack:run".to_owned()));
    }

    #[test]
    fn no_images_is_invalid_args() {
        let store = MockStore::default();
        let err = run(&store, &request(&[], None, Target::Registry)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgs);
        assert!(store.opened.lock().unwrap().is_empty());
    }

    #[test]
    fn multiple_registries_rejected_before_any_access() {
        let store = MockStore::default();
        let err = run(
            &store,
            &request(
                &["registry-a.example/app:1", "registry-b.example/app:1"],
                None,
                Target::Registry,
            ),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgs);
        assert!(store.opened.lock().unwrap().is_empty());
        assert!(store.saved.lock().unwrap().is_empty());
    }

    #[test]
    fn daemon_target_allows_names_on_several_registries() {
        let store = MockStore::default();
        store.insert("run.io/app:1", app_with_stack("run.io/stack:run", &[]));
        store.insert("run.io/stack:run", image(&["C1"]));

        let report = run(
            &store,
            &request(&["run.io/app:1", "other.io/app:copy"], None, Target::Daemon),
        )
        .unwrap();
        assert_eq!(report.saved.len(), 2);
        assert_eq!(report.target, "daemon");
    }

    #[test]
    fn missing_stack_metadata_without_run_image_is_invalid_args() {
        let store = MockStore::default();
        let mut app = image(&["B1", "A1"]);
        app.set_label(METADATA_LABEL, r#"{"runImage":{"topLayer":"B1"}}"#);
        store.insert("run.io/app:1", app);

        let err = run(&store, &request(&["run.io/app:1"], None, Target::Registry)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgs);
        assert!(err.to_string().contains("run image reference is required"));
    }

    #[test]
    fn missing_app_image_is_access_error() {
        let store = MockStore::default();
        let err = run(&store, &request(&["run.io/app:1"], None, Target::Registry)).unwrap_err();
        assert!(matches!(
            err,
            RebaseError::ImageAccess {
                role: ImageRole::App,
                ..
            }
        ));
    }

    #[test]
    fn missing_base_image_is_access_error() {
        let store = MockStore::default();
        store.insert("run.io/app:1", app_with_stack("run.io/stack:run", &[]));
        let err = run(&store, &request(&["run.io/app:1"], None, Target::Registry)).unwrap_err();
        assert!(matches!(
            err,
            RebaseError::ImageAccess {
                role: ImageRole::Base,
                ..
            }
        ));
        assert!(store.saved.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_label_is_metadata_error() {
        let store = MockStore::default();
        store.insert("run.io/app:1", image(&["B1", "A1"]));
        let err = run(&store, &request(&["run.io/app:1"], None, Target::Registry)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetadataDecode);
    }

    #[test]
    fn undecodable_app_fails_before_base_is_opened() {
        let store = MockStore::default();
        store.insert("run.io/app:1", image(&["B1", "A1"]));
        let err = run(
            &store,
            &request(&["run.io/app:1"], Some("run.io/missing:1"), Target::Registry),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetadataDecode);
        assert_eq!(*store.opened.lock().unwrap(), vec!["run.io/app:1"]);
    }

    #[test]
    fn every_name_is_attempted_after_a_save_failure() {
        let mut store = MockStore::default();
        store.fail_saves.insert("run.io/app:extra1".to_owned());
        store.insert("run.io/app:1", app_with_stack("run.io/stack:run", &[]));
        store.insert("run.io/stack:run", image(&["C1"]));

        let err = run(
            &store,
            &request(
                &["run.io/app:1", "run.io/app:extra1", "run.io/app:extra2"],
                None,
                Target::Registry,
            ),
        )
        .unwrap_err();

        match err {
            RebaseError::Save(failure) => {
                assert_eq!(failure.failed.len(), 1);
                assert_eq!(failure.failed[0].0, "run.io/app:extra1");
                assert_eq!(failure.saved, vec!["run.io/app:1", "run.io/app:extra2"]);
            }
            other => panic!("expected Save, got {other:?}"),
        }
        assert_eq!(
            *store.saved.lock().unwrap(),
            vec!["run.io/app:1", "run.io/app:extra2"]
        );
    }

    #[test]
    fn report_serializes_to_toml() {
        let store = MockStore::default();
        store.insert("run.io/app:1", app_with_stack("run.io/stack:run", &[]));
        store.insert("run.io/stack:run", image(&["C1"]));
        let report = run(&store, &request(&["run.io/app:1"], None, Target::Registry)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("report.toml");
        report.write_toml(&path).unwrap();
        let back: RebaseReport = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn unwritable_report_path_is_a_write_error() {
        let store = MockStore::default();
        store.insert("run.io/app:1", app_with_stack("run.io/stack:run", &[]));
        store.insert("run.io/stack:run", image(&["C1"]));
        let report = run(&store, &request(&["run.io/app:1"], None, Target::Registry)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let path = blocker.join("report.toml");
        let err = report.write_toml(&path).unwrap_err();
        assert!(matches!(err, ReportError::Write { .. }), "{err}");
        assert!(err
            .to_string()
            .starts_with(&format!("failed to write report {}", path.display())));
    }
}
