pub mod cache_miss;
pub mod cacheable;
pub mod densemap;
pub mod dispatcher;
pub mod file_access;
pub mod fingerprint;
pub mod graph;
pub mod load;
pub mod paths;
pub mod perf;
pub mod pip;
pub mod run;
pub mod trace;
pub mod traversal;
pub mod violations;

#[cfg(not(any(windows, target_arch = "wasm32")))]
use jemallocator::Jemalloc;

#[cfg(not(any(windows, target_arch = "wasm32")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
