use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::config::ProgramsConfig;

/// Program of the day: which device ordering drives ramp and steal priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProgramKind {
    /// Battery and boilers first, heaters last.
    Modest,
    /// Heaters first, battery last.
    Greedy,
    /// Heaters, then battery, then boilers.
    Plenty,
    /// Boilers first.
    Boilers,
    Boiler1,
    Boiler3,
}

impl ProgramKind {
    pub fn names<'a>(&self, cfg: &'a ProgramsConfig) -> &'a [String] {
        match self {
            ProgramKind::Modest => &cfg.modest,
            ProgramKind::Greedy => &cfg.greedy,
            ProgramKind::Plenty => &cfg.plenty,
            ProgramKind::Boilers => &cfg.boilers,
            ProgramKind::Boiler1 => &cfg.boiler1,
            ProgramKind::Boiler3 => &cfg.boiler3,
        }
    }
}

/// A resolved program: device indices into the registry in priority order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub kind: ProgramKind,
    pub order: Vec<usize>,
}

impl Program {
    /// Resolves configured names against the registry. Unknown names are
    /// skipped.
    pub fn resolve(kind: ProgramKind, cfg: &ProgramsConfig, registry: &[String]) -> Self {
        let order = kind
            .names(cfg)
            .iter()
            .filter_map(|name| registry.iter().position(|r| r == name))
            .collect();
        Self { kind, order }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_resolve_skips_unknown() {
        let cfg = ProgramsConfig::default();
        let registry: Vec<String> = vec!["boiler1".into(), "akku".into(), "kitchen".into()];
        let p = Program::resolve(ProgramKind::Modest, &cfg, &registry);
        assert_eq!(p.order, vec![1, 0, 2]);
    }

    #[test]
    fn test_parse() {
        assert_eq!(ProgramKind::from_str("GREEDY").unwrap(), ProgramKind::Greedy);
        assert_eq!(ProgramKind::Boiler3.to_string(), "boiler3");
        assert_eq!(ProgramKind::iter().count(), 6);
    }
}
