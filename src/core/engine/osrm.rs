//! OSRM backend using the multi-level Dijkstra pipeline

use std::path::Path;

use async_trait::async_trait;

use super::{BuildContext, BuildResult, ContainerSession, GraphBuilder, CONTAINER_EXTRACT, CONTAINER_GRAPH};
use crate::core::error::Result;

pub const NAME: &str = "osrm";

/// Routing profile shipped in the official image
const PROFILE: &str = "/opt/car.lua";

pub struct Osrm {
    session: ContainerSession,
}

impl Osrm {
    pub fn new(ctx: BuildContext) -> Self {
        Self {
            session: ContainerSession::new(NAME, ctx),
        }
    }

    pub fn boxed(ctx: BuildContext) -> Box<dyn GraphBuilder> {
        Box::new(Self::new(ctx))
    }

    /// osrm-extract writes next to its input, so the extract is copied into
    /// the graph directory first and removed once the graph is done
    pub fn build_command() -> Vec<String> {
        let pbf = format!("{CONTAINER_GRAPH}/extract.osm.pbf");
        let osrm = format!("{CONTAINER_GRAPH}/extract.osrm");
        let script = format!(
            "cp {CONTAINER_EXTRACT} {pbf} && \
             osrm-extract -p {PROFILE} {pbf} && \
             osrm-partition {osrm} && \
             osrm-customize {osrm} && \
             rm {pbf}"
        );
        vec!["sh".to_string(), "-c".to_string(), script]
    }
}

#[async_trait]
impl GraphBuilder for Osrm {
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::runtime::testing::FakeRuntime;
    use crate::core::geometry::BoundingBox;
    use std::sync::Arc;

    #[test]
    fn test_build_command() {
        let cmd = Osrm::build_command();
        assert_eq!(&cmd[..2], ["sh", "-c"]);
        assert_eq!(
            cmd[2],
            "cp /data/extract.osm.pbf /data/graph/extract.osm.pbf && \
             osrm-extract -p /opt/car.lua /data/graph/extract.osm.pbf && \
             osrm-partition /data/graph/extract.osrm && \
             osrm-customize /data/graph/extract.osrm && \
             rm /data/graph/extract.osm.pbf"
        );
    }

    #[tokio::test]
    async fn test_failed_build_keeps_container() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(&["osrm/osrm-backend:latest"], |_, _| {
            (1, "[error] Input file not found".to_string())
        }));

        let mut osrm = Osrm::new(BuildContext {
            image: "osrm/osrm-backend:latest".to_string(),
            graph_dir: dir.path().join("graph"),
            runtime: runtime.clone(),
        });
        let result = osrm.build_graph(&dir.path().join("x.pbf")).await.unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("Input file not found"));
        assert_eq!(runtime.running(), 1);
        assert!(osrm.execution_handle().is_some());

        // Whole graph directory is packaged
        std::fs::write(dir.path().join("graph/extract.osrm.mldgr"), b"g").unwrap();
        let files = osrm
            .package_files(&BoundingBox::new(0.0, 0.0, 1.0, 1.0))
            .unwrap();
        assert_eq!(files, vec![dir.path().join("graph/extract.osrm.mldgr")]);
    }
}
