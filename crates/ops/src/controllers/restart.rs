use async_trait::async_trait;
use keel_core::Component;

use super::start::start_one;
use super::stop::stop_one;
use super::{run_each, OpContext, Operation};
use crate::error::ControllerError;

/// Stop then start. A component whose stop fails or times out is not started again.
pub(crate) struct Restart {
    pub(crate) components: Vec<Component>,
}

#[async_trait]
impl Operation for Restart {
    async fn run(&self, cx: &OpContext) -> Result<(), ControllerError> {
        run_each(cx, &self.components, "restart", |c| async move {
            stop_one(cx, c).await?;
            cx.trace(c, "stopped; starting again");
            start_one(cx, c).await
        })
        .await
    }
}
