use std::sync::Arc;

use pm_bus::Bus;
use pm_providers::AnthropicClient;
use pm_service::PmService;

#[derive(Clone)]
pub struct AppState {
	pub service: Arc<PmService>,
	pub bus: Arc<Bus>,
}

impl AppState {
	pub async fn new(config: pm_config::Config) -> color_eyre::Result<Self> {
		let db = pm_storage::db::Db::connect(&config.storage.postgres).await?;

		db.ensure_schema().await?;

		let bus = Arc::new(Bus::new());
		let llm = Arc::new(AnthropicClient::new(config.llm.clone())?);
		let service = Arc::new(PmService::new(config, db, Arc::clone(&bus), llm));

		Ok(Self { service, bus })
	}
}
