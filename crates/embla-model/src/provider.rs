// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{CompletionRequest, ResponseEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable provider id for status display and routing decisions.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// `<provider>/<model>` string attached to routing decisions.
    fn model_ref(&self) -> String {
        format!("{}/{}", self.name(), self.model_name())
    }

    /// Context window of the configured model, in tokens.
    fn context_window(&self) -> usize;

    /// Returns `true` if this model accepts image content parts.  Providers
    /// default to `false` so images are never sent to a backend that cannot
    /// handle them.
    fn supports_images(&self) -> bool {
        false
    }

    /// Send a completion request and return a streaming response.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;
}
