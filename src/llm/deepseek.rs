//! DeepSeek 便捷构造：OpenAI 兼容端点 + DEEPSEEK_API_KEY

use crate::llm::OpenAiClient;

pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";

/// 创建指向 DeepSeek 端点的客户端；model 为空时用 deepseek-chat
pub fn create_deepseek_client(model: Option<&str>) -> OpenAiClient {
    let model = model.unwrap_or(DEEPSEEK_CHAT);
    let api_key = std::env::var("DEEPSEEK_API_KEY")
        .or_else(|_| std::env::var("OPENAI_API_KEY"))
        .ok();
    OpenAiClient::new(Some(DEEPSEEK_BASE_URL), model, api_key.as_deref())
}
