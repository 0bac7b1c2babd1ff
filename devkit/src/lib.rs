/*!
# rpi-monitor DevKit

Test tooling for the monitor daemon:
- MQTT client stub recording publishes and subscriptions without a broker
- Harness with topic expectations and JSON field assertions
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockMessage, MockMqttClient};
pub use test_utils::TestHarness;
