use async_trait::async_trait;

use crate::error::CoreError;
use crate::model::Category;

use super::util::generate_subscription_payload;
use super::{Params, Publisher};

/// 最朴素的发布通道：订阅直接打到标准输出。
pub struct StdoutPublisher;

#[async_trait]
impl Publisher for StdoutPublisher {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn publish(&self, categories: &[Category], params: &Params) -> Result<(), CoreError> {
        let payload = generate_subscription_payload(categories, params)?;

        println!("========== PUBLISHED SUBSCRIPTION ==========");
        println!("{}", payload);
        println!("============================================");
        Ok(())
    }
}
