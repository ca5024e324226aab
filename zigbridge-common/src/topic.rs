//! MQTT topic builders, parsers, and wildcard matching.
//!
//! Topics follow the pattern:
//!
//! ```text
//! <base>/<device>                  retained aggregated state
//! <base>/<device>/set              commands (subscribed)
//! <base>/<device>/get              read requests (subscribed)
//! <base>/<device>/availability     "online" / "offline" (retained)
//! <base>/<device>/status           per-device command outcome
//! <base>/bridge/state              bridge availability (retained, last will)
//! <base>/bridge/request/<name>     bridge requests (subscribed)
//! <base>/bridge/response/<name>    bridge request results
//! <base>/bridge/event/<name>       bridge events
//! ```

/// Reserved first level below the base topic for bridge-wide topics.
pub const BRIDGE_SEGMENT: &str = "bridge";

/// Builder for constructing bridge topics under a base topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    base: String,
}

impl TopicBuilder {
    /// Create a new topic builder for a base topic.
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    /// Get the base topic.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Retained state document of a device.
    ///
    /// # Example
    /// ```
    /// use zigbridge_common::topic::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("zigbee2mqtt");
    /// assert_eq!(topics.device_state("kitchen_sensor"), "zigbee2mqtt/kitchen_sensor");
    /// ```
    pub fn device_state(&self, device: &str) -> String {
        format!("{}/{}", self.base, device)
    }

    /// Command topic of a device.
    pub fn device_set(&self, device: &str) -> String {
        format!("{}/{}/set", self.base, device)
    }

    /// Read-request topic of a device.
    pub fn device_get(&self, device: &str) -> String {
        format!("{}/{}/get", self.base, device)
    }

    /// Retained availability topic of a device.
    ///
    /// # Example
    /// ```
    /// use zigbridge_common::topic::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("zigbee2mqtt");
    /// assert_eq!(
    ///     topics.device_availability("lamp"),
    ///     "zigbee2mqtt/lamp/availability"
    /// );
    /// ```
    pub fn device_availability(&self, device: &str) -> String {
        format!("{}/{}/availability", self.base, device)
    }

    /// Command outcome topic of a device.
    pub fn device_status(&self, device: &str) -> String {
        format!("{}/{}/status", self.base, device)
    }

    /// Bridge-wide availability topic (carries the last will).
    pub fn bridge_state(&self) -> String {
        format!("{}/{}/state", self.base, BRIDGE_SEGMENT)
    }

    /// Bridge information document.
    pub fn bridge_info(&self) -> String {
        format!("{}/{}/info", self.base, BRIDGE_SEGMENT)
    }

    /// Retained list of known devices.
    pub fn bridge_devices(&self) -> String {
        format!("{}/{}/devices", self.base, BRIDGE_SEGMENT)
    }

    /// Bridge event topic.
    pub fn bridge_event(&self, name: &str) -> String {
        format!("{}/{}/event/{}", self.base, BRIDGE_SEGMENT, name)
    }

    /// Bridge request topic.
    pub fn bridge_request(&self, name: &str) -> String {
        format!("{}/{}/request/{}", self.base, BRIDGE_SEGMENT, name)
    }

    /// Bridge response topic.
    pub fn bridge_response(&self, name: &str) -> String {
        format!("{}/{}/response/{}", self.base, BRIDGE_SEGMENT, name)
    }

    /// Subscription patterns covering every inbound command topic.
    pub fn command_wildcards(&self) -> Vec<String> {
        vec![
            format!("{}/+/set", self.base),
            format!("{}/+/get", self.base),
            format!("{}/{}/request/#", self.base, BRIDGE_SEGMENT),
        ]
    }
}

/// Parsed inbound topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTopic<'a> {
    /// `<base>/<device>/set`
    DeviceSet(&'a str),
    /// `<base>/<device>/get`
    DeviceGet(&'a str),
    /// `<base>/bridge/request/<name>` where name may contain `/`.
    BridgeRequest(&'a str),
}

/// Parse an inbound command topic.
///
/// Returns `None` for topics outside the base or not addressed to the bridge.
pub fn parse_topic<'a>(base: &str, topic: &'a str) -> Option<ParsedTopic<'a>> {
    let rest = topic.strip_prefix(base)?.strip_prefix('/')?;

    if let Some(request) = rest
        .strip_prefix(BRIDGE_SEGMENT)
        .and_then(|r| r.strip_prefix("/request/"))
    {
        if request.is_empty() {
            return None;
        }
        return Some(ParsedTopic::BridgeRequest(request));
    }

    let (device, action) = rest.split_once('/')?;
    if device.is_empty() || device == BRIDGE_SEGMENT {
        return None;
    }

    match action {
        "set" => Some(ParsedTopic::DeviceSet(device)),
        "get" => Some(ParsedTopic::DeviceGet(device)),
        _ => None,
    }
}

/// Check whether a topic matches an MQTT subscription pattern.
///
/// Supports the single-level `+` and multi-level `#` wildcards.
///
/// # Example
/// ```
/// use zigbridge_common::topic::topic_matches;
///
/// assert!(topic_matches("zigbee2mqtt/+/set", "zigbee2mqtt/lamp/set"));
/// assert!(topic_matches("zigbee2mqtt/#", "zigbee2mqtt/bridge/state"));
/// assert!(!topic_matches("zigbee2mqtt/+/set", "zigbee2mqtt/lamp/get"));
/// ```
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Check that a device name can be used as a single topic level.
pub fn is_valid_device_name(name: &str) -> bool {
    !name.is_empty() && name != BRIDGE_SEGMENT && !name.contains(['/', '+', '#'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_builder() {
        let topics = TopicBuilder::new("zigbee2mqtt");

        assert_eq!(topics.device_set("lamp"), "zigbee2mqtt/lamp/set");
        assert_eq!(topics.device_get("lamp"), "zigbee2mqtt/lamp/get");
        assert_eq!(topics.device_status("lamp"), "zigbee2mqtt/lamp/status");
        assert_eq!(topics.bridge_state(), "zigbee2mqtt/bridge/state");
        assert_eq!(
            topics.bridge_event("device_joined"),
            "zigbee2mqtt/bridge/event/device_joined"
        );
        assert_eq!(
            topics.bridge_response("permit_join"),
            "zigbee2mqtt/bridge/response/permit_join"
        );
    }

    #[test]
    fn test_parse_topic() {
        assert_eq!(
            parse_topic("zigbee2mqtt", "zigbee2mqtt/lamp/set"),
            Some(ParsedTopic::DeviceSet("lamp"))
        );
        assert_eq!(
            parse_topic("zigbee2mqtt", "zigbee2mqtt/0x00124b0001abcdef/get"),
            Some(ParsedTopic::DeviceGet("0x00124b0001abcdef"))
        );
        assert_eq!(
            parse_topic("zigbee2mqtt", "zigbee2mqtt/bridge/request/device/remove"),
            Some(ParsedTopic::BridgeRequest("device/remove"))
        );
    }

    #[test]
    fn test_parse_invalid_topic() {
        assert!(parse_topic("zigbee2mqtt", "other/lamp/set").is_none());
        assert!(parse_topic("zigbee2mqtt", "zigbee2mqtt/lamp").is_none());
        assert!(parse_topic("zigbee2mqtt", "zigbee2mqtt/lamp/availability").is_none());
        assert!(parse_topic("zigbee2mqtt", "zigbee2mqtt/bridge/set").is_none());
        assert!(parse_topic("zigbee2mqtt", "zigbee2mqtt/bridge/request/").is_none());
        assert!(parse_topic("zigbee2mqtt", "zigbee2mqttx/lamp/set").is_none());
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(topic_matches("a/+/c", "a/x/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("a/#", "a/b/c/d"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
    }

    #[test]
    fn test_command_wildcards_match_commands() {
        let topics = TopicBuilder::new("zigbee2mqtt");
        let patterns = topics.command_wildcards();
        let matches = |t: &str| patterns.iter().any(|p| topic_matches(p, t));

        assert!(matches(&topics.device_set("lamp")));
        assert!(matches(&topics.device_get("lamp")));
        assert!(matches(&topics.bridge_request("permit_join")));
        assert!(!matches(&topics.device_state("lamp")));
    }

    #[test]
    fn test_device_name_validation() {
        assert!(is_valid_device_name("kitchen_lamp"));
        assert!(!is_valid_device_name("bridge"));
        assert!(!is_valid_device_name("a/b"));
        assert!(!is_valid_device_name(""));
    }
}
