//! OA metric-set and user mmio configurations

use oa_metrics_shared::{Error, Result, MAX_USER_REGISTERS};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::kernel::IoControl;

/// Extra register sampled at query begin and end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegister {
    pub offset: u32,
    /// Width in bytes, 4 or 8
    pub size: u32,
    pub value: u64,
}

impl UserRegister {
    pub fn new(offset: u32, size: u32) -> Self {
        Self {
            offset,
            size,
            value: 0,
        }
    }

    pub fn width_bits(&self) -> u32 {
        self.size * 8
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfiguration {
    registers: Vec<UserRegister>,
}

impl UserConfiguration {
    pub fn new(registers: Vec<UserRegister>) -> Result<Self> {
        if registers.len() > MAX_USER_REGISTERS {
            return Err(Error::parameter(format!(
                "{} user registers requested, at most {} supported",
                registers.len(),
                MAX_USER_REGISTERS
            )));
        }

        for register in &registers {
            if register.offset % 4 != 0 {
                return Err(Error::parameter(format!(
                    "user register {:#x} is not dword aligned",
                    register.offset
                )));
            }
            if register.size != 4 && register.size != 8 {
                return Err(Error::parameter(format!(
                    "user register {:#x} has unsupported size {}",
                    register.offset, register.size
                )));
            }
        }

        Ok(Self { registers })
    }

    /// 32-bit registers at the given offsets.
    pub fn from_offsets(offsets: &[u32]) -> Result<Self> {
        Self::new(offsets.iter().map(|&o| UserRegister::new(o, 4)).collect())
    }

    pub fn registers(&self) -> &[UserRegister] {
        &self.registers
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}

/// Metric set registered with the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OaConfiguration {
    pub set_id: u32,
    pub kernel_id: u64,
}

impl OaConfiguration {
    pub fn load(io: &dyn IoControl, set_id: u32) -> Result<Self> {
        let kernel_id = io.load_metric_set(set_id)?;
        debug!(set_id, kernel_id, "metric set loaded");
        Ok(Self { set_id, kernel_id })
    }

    pub fn unload(&self, io: &dyn IoControl) -> Result<()> {
        io.unload_metric_set(self.kernel_id)?;
        debug!(set_id = self.set_id, kernel_id = self.kernel_id, "metric set unloaded");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Configuration {
    Oa(OaConfiguration),
    User(UserConfiguration),
}

/// Parameters for creating a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationCreateData {
    Oa { set_id: u32 },
    User { registers: Vec<UserRegister> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use oa_metrics_shared::StatusCode;

    #[test]
    fn test_user_configuration_limits() {
        assert!(UserConfiguration::from_offsets(&[0x2000; MAX_USER_REGISTERS]).is_ok());

        let err = UserConfiguration::from_offsets(&[0x2000; MAX_USER_REGISTERS + 1]).unwrap_err();
        assert_eq!(err.status(), StatusCode::IncorrectParameter);
    }

    #[test]
    fn test_user_register_validation() {
        assert!(UserConfiguration::new(vec![UserRegister::new(0x2002, 4)]).is_err());
        assert!(UserConfiguration::new(vec![UserRegister::new(0x2000, 2)]).is_err());

        let config = UserConfiguration::new(vec![UserRegister::new(0x2000, 8)]).unwrap();
        assert_eq!(config.registers()[0].width_bits(), 64);
    }
}
