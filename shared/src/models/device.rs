//! Device Info Model (已生产设备)

use serde::{Deserialize, Serialize};

/// One allocated device bound to a sub-order and a generate batch
///
/// `is_inited`, `is_disk_checked` and `is_delivered` only ever move from
/// `false` to `true`. [`DeviceInfo::merge_flags`] is how every writer keeps
/// that property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: u64,
    pub sub_order_id: String,
    pub generate_id: u64,
    pub ip: String,
    #[serde(default)]
    pub asset_id: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub cpu_core: u32,
    #[serde(default)]
    pub is_inited: bool,
    #[serde(default)]
    pub is_disk_checked: bool,
    #[serde(default)]
    pub is_delivered: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DeviceInfo {
    pub fn new(
        id: u64,
        sub_order_id: impl Into<String>,
        generate_id: u64,
        ip: impl Into<String>,
    ) -> Self {
        let now = crate::util::now_millis();
        Self {
            id,
            sub_order_id: sub_order_id.into(),
            generate_id,
            ip: ip.into(),
            asset_id: String::new(),
            device_type: String::new(),
            cpu_core: 0,
            is_inited: false,
            is_disk_checked: false,
            is_delivered: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fold the flags of a previously stored copy into this one
    pub fn merge_flags(&mut self, stored: &DeviceInfo) {
        self.is_inited |= stored.is_inited;
        self.is_disk_checked |= stored.is_disk_checked;
        self.is_delivered |= stored.is_delivered;
    }
}
