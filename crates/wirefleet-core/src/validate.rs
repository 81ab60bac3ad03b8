//! Record validation and hook sanitizing

use regex::Regex;
use std::sync::LazyLock;

use crate::address::is_valid_cidr;
use crate::error::{FleetError, Result};
use crate::types::{Device, Network, Peer, Service, Settings};

pub const NAME_MIN_LEN: usize = 2;
pub const NAME_MAX_LEN: usize = 40;
/// Device names are hostnames
pub const HOSTNAME_MAX_LEN: usize = 253;
pub const LABEL_MAX_LEN: usize = 63;

/// Dot-separated DNS labels
static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])$",
    )
    .expect("name pattern compiles")
});

/// Characters stripped from routing hook commands
const HOOK_FORBIDDEN: &[char] = &[
    '/', '\\', ':', '*', '?', '"', '<', '>', '|', '&', '%', '$', '#', '@', '!',
];

fn check_name(field: &str, name: &str, errors: &mut Vec<String>) {
    if name.len() < NAME_MIN_LEN || name.len() > NAME_MAX_LEN {
        errors.push(format!(
            "{} must be between {}-{} chars",
            field, NAME_MIN_LEN, NAME_MAX_LEN
        ));
    }
    if !NAME_PATTERN.is_match(name) {
        errors.push(format!("{} can only contain ascii chars a-z,-,0-9", field));
    }
}

fn check_addresses(field: &str, addresses: &[String], errors: &mut Vec<String>) {
    if addresses.is_empty() {
        errors.push(format!("{} field is required", field));
    }
    for address in addresses {
        if !is_valid_cidr(address) {
            errors.push(format!("{} {} is invalid", field, address));
        }
    }
}

fn finish(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(FleetError::Validation(errors))
    }
}

pub fn validate_network(network: &Network) -> Result<()> {
    let mut errors = Vec::new();
    if network.id.is_empty() {
        errors.push("id is required".to_string());
    }
    check_name("name", &network.name, &mut errors);
    check_addresses("default address", &network.default.address, &mut errors);
    for allowed in &network.default.allowed_ips {
        if !is_valid_cidr(allowed) {
            errors.push(format!("allowed ip {} is invalid", allowed));
        }
    }
    finish(errors)
}

pub fn validate_peer(peer: &Peer) -> Result<()> {
    let mut errors = Vec::new();
    check_name("name", &peer.name, &mut errors);
    if peer.net_id.is_empty() {
        errors.push("net id is required".to_string());
    }
    check_addresses("address", &peer.current.address, &mut errors);
    finish(errors)
}

pub fn validate_device(device: &Device) -> Result<()> {
    let mut errors = Vec::new();
    if device.id.is_empty() {
        errors.push("id is required".to_string());
    }
    if device.account_id.is_empty() {
        errors.push("account id is required".to_string());
    }
    if device.name.is_empty() || device.name.len() > HOSTNAME_MAX_LEN {
        errors.push(format!("name must be between 1-{} chars", HOSTNAME_MAX_LEN));
    }
    if !NAME_PATTERN.is_match(&device.name) {
        errors.push("name can only contain ascii chars a-z,-,0-9".to_string());
    }
    if device.name.split('.').any(|label| label.len() > LABEL_MAX_LEN) {
        errors.push(format!("name labels must be at most {} chars", LABEL_MAX_LEN));
    }
    finish(errors)
}

pub fn validate_service(service: &Service) -> Result<()> {
    let mut errors = Vec::new();
    if service.id.is_empty() {
        errors.push("id is required".to_string());
    }
    if service.account_id.is_empty() {
        errors.push("account id is required".to_string());
    }
    check_name("name", &service.name, &mut errors);
    if !is_valid_cidr(&service.default_subnet) {
        errors.push(format!("default subnet {} is invalid", service.default_subnet));
    }
    finish(errors)
}

/// Strip path and shell metacharacters from a hook command
pub fn sanitize_hook(command: &str) -> String {
    command.chars().filter(|c| !HOOK_FORBIDDEN.contains(c)).collect()
}

pub fn sanitize_hooks(settings: &mut Settings) {
    for hook in [
        &mut settings.pre_up,
        &mut settings.post_up,
        &mut settings.pre_down,
        &mut settings.post_down,
    ] {
        *hook = sanitize_hook(hook);
    }
}
