use persistit::config::{BufferPoolSpec, ConfigBuilder};
use persistit::Persistit;
use std::sync::Arc;

#[allow(dead_code)]
pub fn open_engine(dir: &std::path::Path, buffer_count: usize) -> Arc<Persistit> {
    persistit::init_log();
    let config = ConfigBuilder::new()
        .journal_path(dir.to_str().unwrap())
        .buffer_pool(4096, BufferPoolSpec::Count(buffer_count))
        .build()
        .unwrap();
    Persistit::open(config).unwrap()
}
