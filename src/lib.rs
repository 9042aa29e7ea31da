pub mod config;
pub mod datagram;
pub mod dispatch;
pub mod ids;
pub mod network;
pub mod node;
pub mod node_addr;
pub mod routing;
pub mod socket;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
