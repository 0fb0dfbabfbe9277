use super::{ChargeGuard, GuardCommand};

impl ChargeGuard {
    /// Returns false when a stop arrived while the command was being served
    pub(crate) async fn handle_command(&mut self, cmd: GuardCommand) -> bool {
        match cmd {
            GuardCommand::Evaluate(reply) => {
                self.logger.debug("Evaluation requested by handle");
                match self.tick().await {
                    Some(decision) => {
                        let _ = reply.send(decision);
                        true
                    }
                    None => false,
                }
            }
        }
    }
}
