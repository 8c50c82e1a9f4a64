mod host;
mod ota;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
