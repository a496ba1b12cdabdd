mod plugin_logger;

use wxbot::prelude::WxBot;

use plugin_logger::MessageLoggerPlugin;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let bot = WxBot::builder()
        .config_path(config_path)
        .plugin("message_logger", MessageLoggerPlugin::new)
        .build();

    bot.run().await?;
    Ok(())
}
