//! Valhalla backend

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;

use super::{BuildContext, BuildResult, ContainerSession, GraphBuilder, CONTAINER_EXTRACT, CONTAINER_GRAPH};
use crate::core::error::Result;
use crate::core::geometry::BoundingBox;
use crate::core::package::collect_files;
use crate::core::tiles::select_tiles;

pub const NAME: &str = "valhalla";

/// Builds Valhalla graph tiles with `valhalla_build_tiles`
pub struct Valhalla {
    session: ContainerSession,
}

impl Valhalla {
    pub fn new(ctx: BuildContext) -> Self {
        Self {
            session: ContainerSession::new(NAME, ctx),
        }
    }

    pub fn boxed(ctx: BuildContext) -> Box<dyn GraphBuilder> {
        Box::new(Self::new(ctx))
    }

    /// Build command; the inline config only carries paths
    pub fn build_command() -> Vec<String> {
        let config = json!({ "mjolnir": { "tile_dir": CONTAINER_GRAPH } });
        vec![
            "valhalla_build_tiles".to_string(),
            "--inline-config".to_string(),
            config.to_string(),
            CONTAINER_EXTRACT.to_string(),
        ]
    }
}

#[async_trait]
impl GraphBuilder for Valhalla {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn build_graph(&mut self, extract: &Path) -> Result<BuildResult> {
        self.session.run(extract, Self::build_command()).await
    }

    async fn cleanup(&mut self) -> Result<()> {
        self.session.cleanup().await
    }

    fn execution_handle(&self) -> Option<&str> {
        self.session.handle()
    }

    fn output_directory(&self) -> &Path {
        self.session.graph_dir()
    }

    /// Only the tiles touching `query`; the build also covers the extract's
    /// complete ways beyond the box
    fn package_files(&self, query: &BoundingBox) -> Result<Vec<PathBuf>> {
        let root = self.output_directory();
        let files = collect_files(root)?;
        Ok(select_tiles(&files, root, query).into_iter().collect())
    }
}
