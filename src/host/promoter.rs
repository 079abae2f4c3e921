//! Promoter: pushes a prompt to every downstream host once new notifiable
//! events have been committed. Resolves a headless prompt against the
//! current max notification id before forwarding. Awaits every downstream
//! push before taking the next item off the queue — the back-pressure point
//! that keeps a slow downstream from being flooded.

use tokio::sync::mpsc;
use tracing::error;

use crate::model::Prompt;

use super::{HostHandle, PromptItem};

pub async fn run(host: HostHandle, mut prompt_rx: mpsc::UnboundedReceiver<PromptItem>) {
    while let Some(item) = prompt_rx.recv().await {
        let prompt = match item {
            PromptItem::Item(prompt) => prompt,
            PromptItem::Shutdown => break,
        };

        let head = match prompt.head {
            Some(head) => head,
            None => match host.store.get_max_notification_id(host.pipeline, &host.name).await {
                Ok(head) => head,
                Err(e) => {
                    error!(process = %host.name, error = %e, "failed to resolve headless prompt");
                    continue;
                }
            },
        };
        let resolved = Prompt::with_head(prompt.sender.clone(), prompt.pipeline, head);

        let downstream: Vec<HostHandle> = host.downstream_handles.read().unwrap().values().cloned().collect();
        let pushes = downstream.iter().map(|handle| handle.prompt(resolved.clone()));
        futures::future::join_all(pushes).await;
    }
}
