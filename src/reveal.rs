use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::session::SessionEvent;
use crate::transcript::MessageId;

// Client-side reveal of an already-complete response: one character per tick,
// each prefix posted to the session queue before the next tick. Cancelling the
// token stops the timer without emitting further steps.
pub fn spawn_reveal(
    message_id: MessageId,
    full_text: String,
    interval: Duration,
    tx: UnboundedSender<SessionEvent>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shown = String::with_capacity(full_text.len());
        for ch in full_text.chars() {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            shown.push(ch);
            if tx
                .send(SessionEvent::RevealStep {
                    message_id,
                    body: shown.clone(),
                })
                .is_err()
            {
                return;
            }
        }
        let _ = tx.send(SessionEvent::RevealCompleted { message_id });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn reveal_emits_every_prefix_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = spawn_reveal(
            3,
            "Hi!".to_string(),
            Duration::from_millis(1),
            tx,
            token,
        );

        let mut bodies = Vec::new();
        let mut completed = false;
        while let Some(ev) = rx.recv().await {
            match ev {
                SessionEvent::RevealStep { message_id, body } => {
                    assert_eq!(message_id, 3);
                    bodies.push(body);
                }
                SessionEvent::RevealCompleted { message_id } => {
                    assert_eq!(message_id, 3);
                    completed = true;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        handle.await.expect("join");

        assert_eq!(bodies, vec!["H".to_string(), "Hi".to_string(), "Hi!".to_string()]);
        assert!(completed);
    }

    #[tokio::test]
    async fn reveal_stops_on_cancellation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        token.cancel();
        let handle = spawn_reveal(
            0,
            "never shown".to_string(),
            Duration::from_millis(1),
            tx,
            token,
        );
        handle.await.expect("join");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn empty_text_completes_without_steps() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_reveal(
            1,
            String::new(),
            Duration::from_millis(1),
            tx,
            CancellationToken::new(),
        );
        handle.await.expect("join");
        match rx.recv().await {
            Some(SessionEvent::RevealCompleted { message_id }) => assert_eq!(message_id, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }
}
