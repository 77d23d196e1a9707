use serde::{Deserialize, Serialize};

/// Token usage reported by the gateway for one generation
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Input tokens consumed
    #[serde(default, alias = "promptTokens")]
    pub input_tokens: u32,

    /// Output tokens generated
    #[serde(default, alias = "completionTokens")]
    pub output_tokens: u32,

    /// Reasoning tokens, when the model reports them separately
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u32>,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            reasoning_tokens: None,
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Metadata carried by the terminating `finish` record of a stream
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FinishMetadata {
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub model_id: Option<String>,
    /// Cost charged by the gateway, in USD
    #[serde(default)]
    pub gateway_cost: Option<f64>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_tokens() {
        assert_eq!(TokenUsage::new(12, 30).total_tokens(), 42);
    }

    #[test]
    fn test_usage_accepts_openai_names() {
        let usage: TokenUsage =
            serde_json::from_str(r#"{"promptTokens": 3, "completionTokens": 4}"#).unwrap();
        assert_eq!(usage, TokenUsage::new(3, 4));
    }
}
