use std::path::{Path, PathBuf};
use std::sync::Arc;

use rrtree::{NodeCapacity, RRTree, RRTreeConfig, RRTreeResult};
use tempfile::TempDir;

/// A tree in its own temporary directory.
#[derive(Clone)]
pub struct TestContext {
    dir: Arc<TempDir>,
    tree: Arc<RRTree>,
}

impl TestContext {
    pub fn tree(&self) -> &RRTree {
        &self.tree
    }

    pub fn path(&self) -> PathBuf {
        tree_path(self.dir.path())
    }
}

fn tree_path(dir: &Path) -> PathBuf {
    dir.join("test.rrtree")
}

/// Small nodes so that modest data sets build multi-level trees.
pub fn small_config() -> RRTreeConfig {
    RRTreeConfig::new()
        .with_node_capacity(NodeCapacity::new(4, 2, 4))
        .with_buffer_capacity(32)
        .with_cache_pages(16)
}

pub fn create_test_context(config: RRTreeConfig) -> RRTreeResult<TestContext> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir()?;
    let tree = RRTree::create(tree_path(dir.path()), config)?;
    Ok(TestContext {
        dir: Arc::new(dir),
        tree: Arc::new(tree),
    })
}

pub fn cleanup(ctx: TestContext) -> RRTreeResult<()> {
    ctx.tree().close()
}

pub fn run_test<B, T, A>(before: B, test: T, after: A)
where
    B: Fn() -> RRTreeResult<TestContext>,
    T: Fn(TestContext) -> RRTreeResult<()>,
    A: Fn(TestContext) -> RRTreeResult<()>,
{
    let ctx = match before() {
        Ok(ctx) => ctx,
        Err(e) => panic!("Before run failed: {:?}", e),
    };
    if let Err(e) = test(ctx.clone()) {
        panic!("Test failed: {:?}", e);
    }
    if let Err(e) = after(ctx) {
        panic!("After run failed: {:?}", e);
    }
}
