use openevse_http::ClientError;
use thiserror::Error;

use super::charger::Charger;

/// RAPI reply for a rejected argument.
const NK_INVALID_VALUE: &str = "$NK^21";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Value invalid for command {0}")]
    InvalidValue(String),

    /// The charger echoed back a different command
    #[error("Command {0} failed")]
    CommandFailed(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Send a RAPI command and check the echo.
pub async fn send_command(charger: &dyn Charger, command: &str) -> Result<(), CommandError> {
    let (echo, reply) = charger.send_command(command).await?;
    if echo != command {
        return Err(CommandError::CommandFailed(command.to_string()));
    }
    if reply == NK_INVALID_VALUE {
        return Err(CommandError::InvalidValue(command.to_string()));
    }
    Ok(())
}

/// Set the charge current. Gateways older than 4.1 have no config endpoint
/// for it and take the RAPI `$SC` command instead.
pub async fn set_charge_current(charger: &dyn Charger, amps: i64) -> Result<(), CommandError> {
    if charger.version_check("4.1.0") {
        charger.set_current(amps).await?;
        Ok(())
    } else {
        send_command(charger, &format!("$SC {}", amps)).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::integrations::openevse::charger::Call;
    use crate::integrations::openevse::charger::MockCharger;

    #[tokio::test]
    async fn test_send_command_checks_echo_and_reply() {
        let mock = MockCharger::fixture();
        send_command(mock.as_ref(), "$SC 16").await.unwrap();

        mock.set_command_reply("$SC 99", "$NK^21");
        assert!(matches!(
            send_command(mock.as_ref(), "$SC 99").await,
            Err(CommandError::InvalidValue(c)) if c == "$SC 99"
        ));

        mock.set_command_reply("$GE", "$OK^20");
        assert!(matches!(
            send_command(mock.as_ref(), "$SC 12").await,
            Err(CommandError::CommandFailed(c)) if c == "$SC 12"
        ));
    }

    #[tokio::test]
    async fn test_charge_current_uses_rapi_on_old_firmware() {
        let mock = MockCharger::fixture();
        set_charge_current(mock.as_ref(), 24).await.unwrap();
        assert_eq!(mock.calls(), vec![Call::SetCurrent(24)]);

        mock.clear_calls();
        mock.set_config("version", json!("3.5.0"));
        set_charge_current(mock.as_ref(), 20).await.unwrap();
        assert_eq!(mock.calls(), vec![Call::SendCommand("$SC 20".to_string())]);
    }
}
