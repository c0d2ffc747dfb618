//! Compile-time configuration loaded via `toml-cfg`.

#[toml_cfg::toml_config]
pub struct Settings {
    #[default("sip:registrar@example.com")]
    pub sip_registrar: &'static str,
    #[default("sip:user@example.com")]
    pub sip_contact: &'static str,
    #[default("user")]
    pub sip_username: &'static str,
    #[default("")]
    pub sip_password: &'static str,
    #[default("sip:100@example.com")]
    pub sip_target: &'static str,
    /// Preferred t140 payload number; 0 picks the default (100).
    #[default(0)]
    pub preferred_t140_map: u8,
    /// Preferred red payload number; 0 picks the default (101), -1 disables
    /// redundancy.
    #[default(0)]
    pub preferred_red_map: i16,
}
