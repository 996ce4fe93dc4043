//! Interactive menu session.

use std::io::{self, BufRead, Write};

use serde_json::Value;

use crate::config::DeviceConfig;
use crate::hub::HubConnection;
use crate::telemetry;
use crate::twin::{render_property_table, PropertyMap};

/// The operator-facing menu loop. One operation per iteration, awaited to
/// completion before the menu shows again; `"0"` exits. Generic over its
/// streams so tests can drive it with in-memory buffers.
pub struct Console<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Console<R, W> {
    pub fn new(input: R, output: W) -> Console<R, W> {
        Console { input, output }
    }

    /// Run the menu until the operator quits or input ends.
    pub async fn run<H: HubConnection>(
        &mut self,
        hub: &mut H,
        config: &DeviceConfig,
    ) -> io::Result<()> {
        loop {
            self.print_menu()?;

            let Some(choice) = self.read_line()? else {
                break;
            };

            match choice.trim() {
                "0" => break,
                "1" => self.send_message(hub, config).await?,
                "2" => self.send_random_messages(hub, config).await?,
                "3" => self.list_desired_properties(hub).await?,
                "4" => self.list_reported_properties(hub).await?,
                "5" => self.set_reported_properties(hub).await?,
                "6" => self.start_inbound_logging(hub)?,
                _ => writeln!(self.output, "Please enter a valid number.")?,
            }
        }
        Ok(())
    }

    fn print_menu(&mut self) -> io::Result<()> {
        writeln!(self.output, "1. Send message to cloud")?;
        writeln!(
            self.output,
            "2. Send a random message over defined period of time"
        )?;
        writeln!(self.output, "3. List all desired properties")?;
        writeln!(self.output, "4. List all reported properties")?;
        writeln!(self.output, "5. Set reported properties")?;
        writeln!(self.output, "6. Receive cloud-to-device messages")?;
        writeln!(self.output, "0. exit")?;
        writeln!(self.output, "\nPlease enter a number from [0-6]:")?;
        self.output.flush()
    }

    /// One line of operator input, `None` once input is exhausted.
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(&['\r', '\n'][..]).to_string()))
    }

    fn prompt(&mut self, text: &str) -> io::Result<Option<String>> {
        writeln!(self.output, "{text}")?;
        self.output.flush()?;
        self.read_line()
    }

    async fn send_message<H: HubConnection>(
        &mut self,
        hub: &mut H,
        config: &DeviceConfig,
    ) -> io::Result<()> {
        let Some(text) = self.prompt("\nPlease enter a message:")? else {
            return Ok(());
        };
        telemetry::send_once(hub, config, text).await;
        Ok(())
    }

    async fn send_random_messages<H: HubConnection>(
        &mut self,
        hub: &mut H,
        config: &DeviceConfig,
    ) -> io::Result<()> {
        let Some(count) = self.prompt("\nEnter a number of messages:")? else {
            return Ok(());
        };
        let Ok(count) = count.trim().parse::<u32>() else {
            writeln!(self.output, "\nEnter a valid whole number.")?;
            return Ok(());
        };

        let Some(interval) =
            self.prompt("\nEnter a time period between messages (in milliseconds):")?
        else {
            return Ok(());
        };
        let Ok(interval) = interval.trim().parse::<u64>() else {
            writeln!(self.output, "\nEnter a valid whole number.")?;
            return Ok(());
        };

        telemetry::send_burst(hub, config, count, interval).await;
        Ok(())
    }

    async fn list_desired_properties<H: HubConnection>(&mut self, hub: &mut H) -> io::Result<()> {
        match hub.fetch_twin().await {
            Ok(twin) => write!(self.output, "{}", render_property_table(&twin.desired))?,
            Err(e) => tracing::error!(error = %e, "failed to fetch the device twin"),
        }
        Ok(())
    }

    async fn list_reported_properties<H: HubConnection>(&mut self, hub: &mut H) -> io::Result<()> {
        match hub.fetch_twin().await {
            Ok(twin) => write!(self.output, "{}", render_property_table(&twin.reported))?,
            Err(e) => tracing::error!(error = %e, "failed to fetch the device twin"),
        }
        Ok(())
    }

    /// Prompt for a replacement value per desired key and submit the staged
    /// set as the new reported properties, one call regardless of key count.
    async fn set_reported_properties<H: HubConnection>(&mut self, hub: &mut H) -> io::Result<()> {
        let twin = match hub.fetch_twin().await {
            Ok(twin) => twin,
            Err(e) => {
                tracing::error!(error = %e, "failed to fetch the device twin");
                return Ok(());
            }
        };

        let mut reported = PropertyMap::new();
        for key in twin.desired.keys() {
            let Some(value) = self.prompt(&format!("For key [{key}] enter value:"))? else {
                return Ok(());
            };
            reported.insert(key.clone(), Value::String(value));
        }

        // an empty desired set still submits; the hub treats the empty
        // patch as a no-op
        if let Err(e) = hub.update_reported(reported).await {
            tracing::error!(error = %e, "failed to update reported properties");
        }
        Ok(())
    }

    /// Start the logging task for cloud-to-device deliveries. The channel
    /// can be taken once per session; afterwards this just says so.
    fn start_inbound_logging<H: HubConnection>(&mut self, hub: &mut H) -> io::Result<()> {
        match hub.take_inbound() {
            Some(mut deliveries) => {
                tokio::spawn(async move {
                    while let Some(message) = deliveries.recv().await {
                        match &message.value {
                            Some(value) => tracing::info!(
                                text = %message.text,
                                value = %value,
                                "received cloud-to-device message",
                            ),
                            None => tracing::info!(
                                text = %message.text,
                                "received cloud-to-device message",
                            ),
                        }
                    }
                });
                writeln!(self.output, "Listening for cloud-to-device messages.")?;
            }
            None => writeln!(self.output, "Already listening for cloud-to-device messages.")?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{self, InboundMessage};
    use crate::twin::TwinProperties;
    use async_trait::async_trait;
    use serde_json::json;
    use std::io::Cursor;
    use tokio::sync::mpsc;

    fn test_config() -> DeviceConfig {
        DeviceConfig {
            hostname: "test-hub.azure-devices.net".into(),
            device_id: "device-1".into(),
            shared_access_key: "c2VjcmV0".into(),
            location: "West Europe".into(),
        }
    }

    /// Records every call instead of talking to a broker.
    #[derive(Default)]
    struct ScriptedHub {
        twin: TwinProperties,
        fail_sends: bool,
        fail_fetches: bool,
        sent: Vec<Vec<u8>>,
        reported: Vec<PropertyMap>,
        fetches: usize,
        inbound: Option<mpsc::UnboundedReceiver<InboundMessage>>,
    }

    #[async_trait]
    impl HubConnection for ScriptedHub {
        async fn send_event(&mut self, payload: Vec<u8>) -> Result<(), hub::Error> {
            self.sent.push(payload);
            if self.fail_sends {
                return Err(hub::Error::ConnectionClosed);
            }
            Ok(())
        }

        async fn fetch_twin(&mut self) -> Result<TwinProperties, hub::Error> {
            self.fetches += 1;
            if self.fail_fetches {
                return Err(hub::Error::ConnectionClosed);
            }
            Ok(self.twin.clone())
        }

        async fn update_reported(&mut self, patch: PropertyMap) -> Result<(), hub::Error> {
            self.reported.push(patch);
            Ok(())
        }

        fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
            self.inbound.take()
        }
    }

    async fn run_session(script: &str, hub: &mut ScriptedHub) -> String {
        let mut output = Vec::new();
        Console::new(Cursor::new(script.to_string()), &mut output)
            .run(hub, &test_config())
            .await
            .unwrap();
        String::from_utf8(output).unwrap()
    }

    #[tokio::test]
    async fn menu_one_sends_the_operator_text_once() {
        let mut hub = ScriptedHub::default();
        run_session("1\nhello\n0\n", &mut hub).await;

        assert_eq!(hub.sent.len(), 1);
        let envelope: serde_json::Value = serde_json::from_slice(&hub.sent[0]).unwrap();
        assert_eq!(envelope["message"], "hello");
        assert_eq!(envelope["deviceId"], "device-1");
        assert_eq!(envelope["location"], "West Europe");
    }

    #[tokio::test]
    async fn menu_two_sends_count_messages_then_returns_to_the_menu() {
        let mut hub = ScriptedHub::default();
        let output = run_session("2\n3\n0\n0\n", &mut hub).await;

        assert_eq!(hub.sent.len(), 3);
        // the menu printed again after the burst
        assert_eq!(output.matches("Please enter a number from [0-6]:").count(), 2);
    }

    #[tokio::test]
    async fn non_numeric_burst_count_sends_nothing() {
        let mut hub = ScriptedHub::default();
        let output = run_session("2\nabc\n0\n", &mut hub).await;

        assert!(hub.sent.is_empty());
        assert!(output.contains("Enter a valid whole number."));
    }

    #[tokio::test]
    async fn negative_burst_interval_sends_nothing() {
        let mut hub = ScriptedHub::default();
        run_session("2\n3\n-5\n0\n", &mut hub).await;
        assert!(hub.sent.is_empty());
    }

    #[tokio::test]
    async fn a_failed_send_does_not_end_the_session() {
        let mut hub = ScriptedHub {
            fail_sends: true,
            ..ScriptedHub::default()
        };
        let output = run_session("1\nhello\n0\n", &mut hub).await;

        assert_eq!(hub.sent.len(), 1);
        assert_eq!(output.matches("Please enter a number from [0-6]:").count(), 2);
    }

    #[tokio::test]
    async fn menu_three_renders_one_row_per_desired_key() {
        let mut hub = ScriptedHub::default();
        hub.twin.desired.insert("color".into(), json!("red"));
        hub.twin.desired.insert("speed".into(), json!(88));
        hub.twin.reported.insert("ignored".into(), json!("x"));

        let output = run_session("3\n0\n", &mut hub).await;
        assert_eq!(hub.fetches, 1);
        assert!(output.contains("color") && output.contains("red"));
        assert!(output.contains("speed") && output.contains("88"));
        assert!(!output.contains("ignored"));
    }

    #[tokio::test]
    async fn menu_four_renders_the_reported_set() {
        let mut hub = ScriptedHub::default();
        hub.twin.reported.insert("firmware".into(), json!("1.2.0"));

        let output = run_session("4\n0\n", &mut hub).await;
        assert!(output.contains("firmware") && output.contains("1.2.0"));
    }

    #[tokio::test]
    async fn every_fetch_hits_the_hub_again() {
        let mut hub = ScriptedHub::default();
        run_session("3\n4\n3\n0\n", &mut hub).await;
        assert_eq!(hub.fetches, 3);
    }

    #[tokio::test]
    async fn menu_five_stages_one_value_per_desired_key_in_order() {
        let mut hub = ScriptedHub::default();
        hub.twin.desired.insert("color".into(), json!("red"));
        hub.twin.desired.insert("speed".into(), json!(88));

        let output = run_session("5\nblue\nslow\n0\n", &mut hub).await;

        assert_eq!(hub.reported.len(), 1);
        let patch = &hub.reported[0];
        assert_eq!(patch.keys().collect::<Vec<_>>(), vec!["color", "speed"]);
        assert_eq!(patch["color"], "blue");
        assert_eq!(patch["speed"], "slow");
        assert!(output.contains("For key [color] enter value:"));
        assert!(output.contains("For key [speed] enter value:"));
    }

    #[tokio::test]
    async fn menu_five_with_no_desired_keys_still_submits_once() {
        let mut hub = ScriptedHub::default();
        run_session("5\n0\n", &mut hub).await;

        assert_eq!(hub.reported.len(), 1);
        assert!(hub.reported[0].is_empty());
    }

    #[tokio::test]
    async fn menu_five_skips_the_submit_when_the_fetch_fails() {
        let mut hub = ScriptedHub {
            fail_fetches: true,
            ..ScriptedHub::default()
        };
        run_session("5\n0\n", &mut hub).await;
        assert!(hub.reported.is_empty());
    }

    #[tokio::test]
    async fn menu_six_can_only_take_the_channel_once() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut hub = ScriptedHub {
            inbound: Some(rx),
            ..ScriptedHub::default()
        };

        let output = run_session("6\n6\n0\n", &mut hub).await;
        assert!(output.contains("Listening for cloud-to-device messages."));
        assert!(output.contains("Already listening for cloud-to-device messages."));
    }

    #[tokio::test]
    async fn unrecognized_input_reprompts_without_error() {
        let mut hub = ScriptedHub::default();
        let output = run_session("9\n0\n", &mut hub).await;

        assert!(output.contains("Please enter a valid number."));
        assert_eq!(output.matches("Please enter a number from [0-6]:").count(), 2);
    }

    #[tokio::test]
    async fn exhausted_input_ends_the_session() {
        let mut hub = ScriptedHub::default();
        run_session("", &mut hub).await;
        assert!(hub.sent.is_empty());
    }
}
