//! Turn a banner and open-port set into a best-guess device template.

use avtool_core::LineEnding;
use serde::Serialize;

pub const TPL_SAMSUNG_MDC: &str = "TPL_SAMSUNG_MDC_EXAMPLE";
pub const TPL_KRAMER_P3000: &str = "TPL_KRAMER_P3000";
pub const TPL_EXTRON_TELNET: &str = "TPL_EXTRON_TELNET";
pub const TPL_LIGHTWARE_LW3: &str = "TPL_LIGHTWARE_LW3";

/// Fallback preference when no rule names a port.
pub const PREFERRED_PORTS: [u16; 4] = [23, 5000, 6100, 1515];

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    /// Empty when nothing matched or the vendor has no template.
    pub template_id: String,
    #[serde(serialize_with = "LineEnding::serialize_escaped")]
    pub suffix: LineEnding,
    pub best_port: Option<u16>,
    pub name_hint: String,
    /// Raw banner text the guess was made from.
    pub fingerprint: String,
}

struct Rule {
    /// Receives the lowercased banner and the open ports.
    matches: fn(&str, &[u16]) -> bool,
    template_id: &'static str,
    suffix: LineEnding,
    port: u16,
    name_hint: &'static str,
}

fn has_mdc_port(_: &str, ports: &[u16]) -> bool {
    ports.contains(&1515)
}

fn is_kramer(b: &str, _: &[u16]) -> bool {
    b.contains("protocol 3000") || b.contains("kramer")
}

fn is_extron(b: &str, _: &[u16]) -> bool {
    b.contains("extron")
}

fn is_lightware(b: &str, _: &[u16]) -> bool {
    b.contains("lightware")
}

fn is_amx(b: &str, _: &[u16]) -> bool {
    b.contains("amx")
}

fn is_crestron(b: &str, _: &[u16]) -> bool {
    b.contains("crestron")
}

/// Evaluated top to bottom; the first match wins.
const RULES: &[Rule] = &[
    Rule {
        matches: has_mdc_port,
        template_id: TPL_SAMSUNG_MDC,
        suffix: LineEnding::None,
        port: 1515,
        name_hint: "Samsung Display (MDC)",
    },
    Rule {
        matches: is_kramer,
        template_id: TPL_KRAMER_P3000,
        suffix: LineEnding::CrLf,
        port: 5000,
        name_hint: "Kramer (P3000)",
    },
    Rule {
        matches: is_extron,
        template_id: TPL_EXTRON_TELNET,
        suffix: LineEnding::Cr,
        port: 23,
        name_hint: "Extron (Telnet)",
    },
    Rule {
        matches: is_lightware,
        template_id: TPL_LIGHTWARE_LW3,
        suffix: LineEnding::CrLf,
        port: 6100,
        name_hint: "Lightware",
    },
    Rule {
        matches: is_amx,
        template_id: "",
        suffix: LineEnding::Cr,
        port: 23,
        name_hint: "AMX",
    },
    Rule {
        matches: is_crestron,
        template_id: "",
        suffix: LineEnding::Cr,
        port: 41794,
        name_hint: "Crestron",
    },
];

pub fn suggest(banner: &str, open_ports: &[u16]) -> Suggestion {
    let lowered = banner.to_lowercase();
    let mut s = Suggestion { fingerprint: banner.to_string(), ..Default::default() };
    if let Some(rule) = RULES.iter().find(|r| (r.matches)(&lowered, open_ports)) {
        s.template_id = rule.template_id.to_string();
        s.suffix = rule.suffix;
        s.best_port = Some(rule.port);
        s.name_hint = rule.name_hint.to_string();
    }
    if s.best_port.is_none() {
        s.best_port = PREFERRED_PORTS
            .iter()
            .copied()
            .find(|p| open_ports.contains(p))
            .or_else(|| open_ports.first().copied());
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kramer_banner() {
        let s = suggest("KRAMER PROTOCOL 3000", &[23, 5000]);
        assert_eq!(s.template_id, TPL_KRAMER_P3000);
        assert_eq!(s.suffix, LineEnding::CrLf);
        assert_eq!(s.best_port, Some(5000));
        assert_eq!(s.fingerprint, "KRAMER PROTOCOL 3000");
    }

    #[test]
    fn mdc_port_short_circuits_banner_rules() {
        let s = suggest("", &[1515]);
        assert_eq!(s.template_id, TPL_SAMSUNG_MDC);
        assert_eq!(s.suffix, LineEnding::None);
        assert_eq!(s.best_port, Some(1515));

        let s = suggest("Kramer Electronics", &[5000, 1515]);
        assert_eq!(s.template_id, TPL_SAMSUNG_MDC);
        assert_eq!(s.name_hint, "Samsung Display (MDC)");
    }

    #[test]
    fn vendor_rules_in_order() {
        assert_eq!(suggest("Extron Electronics IN1604", &[23]).template_id, TPL_EXTRON_TELNET);
        assert_eq!(suggest("Lightware LW3", &[6100]).best_port, Some(6100));
        // extron is checked before lightware
        assert_eq!(suggest("extron lightware", &[]).template_id, TPL_EXTRON_TELNET);

        let amx = suggest("AMX NetLinx", &[23]);
        assert_eq!(amx.template_id, "");
        assert_eq!(amx.suffix, LineEnding::Cr);
        assert_eq!(amx.name_hint, "AMX");

        let crestron = suggest("Crestron Web", &[80]);
        assert_eq!(crestron.best_port, Some(41794));
    }

    #[test]
    fn fallback_port_choice() {
        let s = suggest("", &[80, 6100, 23]);
        assert_eq!(s.template_id, "");
        assert_eq!(s.name_hint, "");
        assert_eq!(s.best_port, Some(23));
        assert_eq!(suggest("nginx", &[8080, 443]).best_port, Some(8080));
        assert_eq!(suggest("", &[]).best_port, None);
        assert_eq!(suggest("unknown box", &[]).fingerprint, "unknown box");
    }

    #[test]
    fn suffix_serializes_escaped() {
        let v = serde_json::to_value(suggest("kramer", &[5000])).unwrap();
        assert_eq!(v["suffix"], "\\r\\n");
        assert_eq!(v["templateId"], TPL_KRAMER_P3000);
        assert_eq!(v["bestPort"], 5000);
    }
}
