mod host;
mod retry;
mod sensors;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
