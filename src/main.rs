#[tokio::main]
async fn main() -> anyhow::Result<()> {
    convochat_lib::run().await
}
