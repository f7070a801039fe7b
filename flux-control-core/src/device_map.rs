#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl DeviceMap {
    /// Builds the device map from the `--cpu` / `--device-ordinal` command line pair.
    pub fn from_flags(cpu: bool, ordinal: usize) -> Self {
        if cpu {
            Self::ForceCpu
        } else {
            Self::Ordinal(ordinal)
        }
    }
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_flag_wins_over_ordinal() {
        assert_eq!(DeviceMap::from_flags(true, 3), DeviceMap::ForceCpu);
        assert_eq!(DeviceMap::from_flags(false, 1), DeviceMap::Ordinal(1));
        assert_eq!(DeviceMap::default(), DeviceMap::Ordinal(0));
    }
}
