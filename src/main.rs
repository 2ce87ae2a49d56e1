#[tokio::main]
async fn main() -> anyhow::Result<()> {
    distcam_lib::run().await
}
