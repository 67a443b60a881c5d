use pacs_proxy::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args()?;
    pacs_proxy::run(config).await
}
