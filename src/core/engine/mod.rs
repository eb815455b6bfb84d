//! Routing engine backends
//!
//! Each engine turns a cropped extract into a graph directory by running its
//! build tooling inside a container. Backends are looked up by name in an
//! [`EngineRegistry`] so new engines only need a constructor registration.

pub mod osrm;
pub mod runtime;
pub mod valhalla;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};

use crate::core::error::{suggest_correction, Error, Result};
use crate::core::geometry::BoundingBox;
use crate::core::package::{collect_files, remove_dir_if_exists};

pub use osrm::Osrm;
pub use runtime::{ContainerRuntime, DockerCli, Mount};
pub use valhalla::Valhalla;

/// Where the extract is mounted inside engine containers
pub const CONTAINER_EXTRACT: &str = "/data/extract.osm.pbf";

/// Where the graph directory is mounted inside engine containers
pub const CONTAINER_GRAPH: &str = "/data/graph";

/// Outcome of one graph build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub exit_code: i32,
    pub output: String,
    pub output_dir: PathBuf,
}

impl BuildResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Everything a backend needs to be constructed for one job
#[derive(Clone)]
pub struct BuildContext {
    /// Container image the build runs in
    pub image: String,
    /// Host directory receiving the graph
    pub graph_dir: PathBuf,
    pub runtime: Arc<dyn ContainerRuntime>,
}

/// A routing engine able to build a graph from an extract
#[async_trait]
pub trait GraphBuilder: Send + Sync {
    /// Registry name of the engine
    fn name(&self) -> &'static str;

    /// Build the graph for `extract` into [`GraphBuilder::output_directory`]
    ///
    /// A nonzero exit code is reported in the result, not as an error.
    async fn build_graph(&mut self, extract: &Path) -> Result<BuildResult>;

    /// Stop and remove the execution environment and the graph directory
    ///
    /// Safe to call any number of times.
    async fn cleanup(&mut self) -> Result<()>;

    /// Identifier of the environment the last build ran in
    fn execution_handle(&self) -> Option<&str>;

    fn output_directory(&self) -> &Path;

    /// Files of the built graph that belong in the package for `query`
    fn package_files(&self, _query: &BoundingBox) -> Result<Vec<PathBuf>> {
        collect_files(self.output_directory())
    }
}

/// Container lifecycle shared by the backends
///
/// Creates one container per build with the extract mounted read-only and
/// the graph directory read-write. The handle outlives [`ContainerSession::dispose`]
/// so it can still be recorded on the job.
pub struct ContainerSession {
    engine: &'static str,
    ctx: BuildContext,
    handle: Option<String>,
    active: bool,
}

impl ContainerSession {
    pub fn new(engine: &'static str, ctx: BuildContext) -> Self {
        Self {
            engine,
            ctx,
            handle: None,
            active: false,
        }
    }

    pub fn graph_dir(&self) -> &Path {
        &self.ctx.graph_dir
    }

    pub fn handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    /// Run `cmd` in a fresh container over `extract`
    pub async fn run(&mut self, extract: &Path, cmd: Vec<String>) -> Result<BuildResult> {
        let runtime = Arc::clone(&self.ctx.runtime);

        if !runtime.image_exists(&self.ctx.image).await? {
            return Err(Error::EngineUnavailable {
                engine: self.engine.to_string(),
                image: self.ctx.image.clone(),
            });
        }

        // A previous build of this session must not leak its container
        self.dispose().await?;

        std::fs::create_dir_all(&self.ctx.graph_dir)?;
        let mounts = [
            Mount::read_only(extract, CONTAINER_EXTRACT),
            Mount::read_write(&self.ctx.graph_dir, CONTAINER_GRAPH),
        ];

        let id = runtime.create(&self.ctx.image, &mounts).await?;
        info!("{} build in container {id}", self.engine);
        self.handle = Some(id.clone());
        self.active = true;

        runtime.start(&id).await?;
        debug!("Container {id}: {}", cmd.join(" "));
        let (exit_code, output) = runtime.exec(&id, &cmd).await?;

        Ok(BuildResult {
            exit_code,
            output,
            output_dir: self.ctx.graph_dir.clone(),
        })
    }

    /// Stop and remove the current container, if any
    pub async fn dispose(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        if let Some(id) = &self.handle {
            self.ctx.runtime.stop(id).await?;
            self.ctx.runtime.remove(id).await?;
            debug!("Removed container {id}");
        }
        self.active = false;
        Ok(())
    }

    /// Dispose of the container and delete the graph directory
    pub async fn cleanup(&mut self) -> Result<()> {
        self.dispose().await?;
        remove_dir_if_exists(&self.ctx.graph_dir)
    }
}

/// Constructs a backend for one job
pub type EngineConstructor = fn(BuildContext) -> Box<dyn GraphBuilder>;

/// Name to constructor map of the available engines
#[derive(Clone, Default)]
pub struct EngineRegistry {
    constructors: BTreeMap<String, EngineConstructor>,
}

impl EngineRegistry {
    /// Registry with every built-in engine
    pub fn standard() -> Self {
        let mut registry = Self::default();
        registry.register(valhalla::NAME, Valhalla::boxed);
        registry.register(osrm::NAME, Osrm::boxed);
        registry
    }

    pub fn register(&mut self, name: &str, constructor: EngineConstructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }

    /// Instantiate the backend registered as `name`
    pub fn create(&self, name: &str, ctx: BuildContext) -> Option<Box<dyn GraphBuilder>> {
        self.constructors.get(name).map(|construct| construct(ctx))
    }

    /// Like [`EngineRegistry::create`], failing with a suggestion for unknown names
    pub fn resolve(&self, name: &str, ctx: BuildContext) -> Result<Box<dyn GraphBuilder>> {
        self.create(name, ctx).ok_or_else(|| Error::UnknownEngine {
            name: name.to_string(),
            suggestion: suggest_correction(name, &self.names()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::runtime::testing::FakeRuntime;
    use super::*;
    use tempfile::tempdir;

    fn context(runtime: Arc<FakeRuntime>, graph_dir: PathBuf) -> BuildContext {
        BuildContext {
            image: "gisops/valhalla:latest".to_string(),
            graph_dir,
            runtime,
        }
    }

    fn writes_graph() -> Arc<FakeRuntime> {
        Arc::new(FakeRuntime::new(
            &["gisops/valhalla:latest"],
            |mounts, _cmd| {
                let graph = mounts.iter().find(|m| !m.read_only).unwrap();
                std::fs::write(graph.host.join("graph.bin"), b"graph").unwrap();
                (0, "done".to_string())
            },
        ))
    }

    #[test]
    fn test_registry_lookup() {
        let registry = EngineRegistry::standard();
        assert_eq!(registry.names(), vec!["osrm", "valhalla"]);
        assert!(registry.contains("valhalla"));
        assert!(!registry.contains("graphhopper"));

        let dir = tempdir().unwrap();
        let ctx = context(writes_graph(), dir.path().join("graph"));
        assert!(registry.create("graphhopper", ctx.clone()).is_none());

        match registry.resolve("valhala", ctx.clone()) {
            Err(Error::UnknownEngine { suggestion, .. }) => {
                assert_eq!(suggestion.as_deref(), Some("valhalla"))
            }
            _ => panic!("expected UnknownEngine"),
        }

        let backend = registry.resolve("osrm", ctx).unwrap();
        assert_eq!(backend.name(), "osrm");
        assert_eq!(backend.output_directory(), dir.path().join("graph"));
        assert_eq!(backend.execution_handle(), None);
    }

    #[tokio::test]
    async fn test_session_mounts_and_cleanup() {
        let dir = tempdir().unwrap();
        let runtime = writes_graph();
        let graph_dir = dir.path().join("graph");
        let mut session = ContainerSession::new("valhalla", context(runtime.clone(), graph_dir.clone()));

        let extract = dir.path().join("extract.osm.pbf");
        let result = session
            .run(&extract, vec!["true".to_string()])
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.output_dir, graph_dir);
        assert!(graph_dir.join("graph.bin").is_file());
        assert_eq!(runtime.running(), 1);

        {
            let state = runtime.state.lock().unwrap();
            let (mounts, _) = state.containers.values().next().unwrap();
            assert_eq!(mounts[0], Mount::read_only(&extract, CONTAINER_EXTRACT));
            assert_eq!(mounts[1], Mount::read_write(&graph_dir, CONTAINER_GRAPH));
        }

        let handle = session.handle().unwrap().to_string();
        session.cleanup().await.unwrap();
        assert_eq!(runtime.existing(), 0);
        assert!(!graph_dir.exists());
        assert_eq!(session.handle(), Some(handle.as_str()));

        // Second cleanup is a no-op
        session.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_missing_image() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(&[], |_, _| (0, String::new())));
        let mut session = ContainerSession::new("valhalla", context(runtime.clone(), dir.path().join("g")));

        let err = session
            .run(&dir.path().join("x.pbf"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EngineUnavailable { ref engine, .. } if engine == "valhalla"));
        assert_eq!(runtime.existing(), 0);
        assert_eq!(session.handle(), None);
    }
}
