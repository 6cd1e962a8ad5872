use crate::error::RunError;
use crate::message::{ChatMessage, MessageType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const MAX_USER_ID: u32 = 100_000;

pub const PHRASES: &[&str] = &[
    "Hello everyone!", "How's it going?", "Good morning!", "Good evening!",
    "Anyone here?", "What's the latest news?", "Great discussion today!",
    "I agree with that point.", "Can someone help me?", "Thanks for the info!",
    "Let me check on that.", "Interesting perspective!", "Welcome to the chat!",
    "Bye for now!", "See you later!", "That's a great idea!",
    "I'll get back to you.", "Working on it now.", "Almost done!",
    "Let's schedule a meeting.", "Please review my PR.", "Build is passing!",
    "Found a bug.", "Fixed the issue!", "Deploying to production.",
    "Tests are green.", "Need a code review.", "Updated the documentation.",
    "Sprint planning tomorrow.", "Standup in 5 minutes.", "Happy Friday!",
    "Monday blues.", "Coffee break?", "Lunch anyone?",
    "New feature shipped!", "Rollback needed.", "Monitoring looks good.",
    "Alert resolved.", "On call this week.", "Incident report filed.",
    "Performance improved!", "Memory usage is high.", "CPU spike detected.",
    "Scaling up instances.", "Cache invalidated.", "Database migration done.",
    "API latency is low.", "Throughput increased!", "Load test passed!",
    "Ready for launch!", "System all green!",
];

/// Single producer of synthetic chat messages.
pub struct MessageGenerator {
    rng: StdRng,
    total: u64,
    rooms: u32,
}

impl MessageGenerator {
    pub fn new(total: u64, rooms: u32, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            total,
            rooms: rooms.max(1),
        }
    }

    pub fn next_message(&mut self) -> ChatMessage {
        let user_id = self.rng.gen_range(1..=MAX_USER_ID);
        let body = PHRASES[self.rng.gen_range(0..PHRASES.len())];
        let room = self.rng.gen_range(1..=self.rooms);
        let message_type = MessageType::from_roll(self.rng.gen_range(0..100));
        ChatMessage::new(user_id, body, message_type, room)
    }

    /// Produce exactly `total` messages into `tx`, waiting while the queue is full.
    ///
    /// Dropping `tx` on return closes the channel, which workers read as "no more work".
    pub async fn run(
        mut self,
        tx: async_channel::Sender<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<u64, RunError> {
        let mut produced = 0u64;
        while produced < self.total {
            let msg = self.next_message();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Generator cancelled after {} messages", produced);
                    return Err(RunError::Cancelled);
                }
                sent = tx.send(msg) => {
                    sent.map_err(|_| RunError::Generator("queue closed by consumers".to_string()))?;
                }
            }
            produced += 1;
        }
        info!("Generator finished: all {} messages enqueued", produced);
        Ok(produced)
    }
}
