/// Tunables the original hardcoded as C preprocessor constants
/// (`NBIO_CHUNKSIZE`, `NBIO_LISTEN_BACKLOG`, the kqueue batch size).
#[derive(Debug, Clone)]
pub struct Config {
    /// Buffered STREAM read/write granularity, in bytes.
    pub chunk_size: usize,
    /// Backlog passed to `listen(2)`.
    pub listen_backlog: i32,
    /// Batch size for one `EventQ::wait`/`poll` call.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            chunk_size: 8192,
            listen_backlog: 256,
            event_capacity: 64,
        }
    }
}
