//! Registry proxy: the scheduler modules' read access to
//! per-user/per-connection state, decoupled from the rest of the
//! station.

use std::rc::Rc;

use airlink_core::{Cid, StationId, StationType};

use crate::classifier::ManagerHandle;
use crate::phy::{PhyMode, BROADCAST_STATION};
use crate::station::StationRegistry;

pub trait RegistryProxy {
    /// The station a CID's traffic is headed to, from this
    /// scheduler's point of view. [`BROADCAST_STATION`] addresses the
    /// whole cell.
    fn user_for_cid(&self, cid: Cid) -> Option<StationId>;

    fn name_for_user(&self, user: StationId) -> String;

    fn my_user_id(&self) -> StationId;

    fn phy_mode_for_user(&self, user: StationId) -> PhyMode;
}

pub struct MacRegistryProxy {
    manager: ManagerHandle,
    stations: Rc<StationRegistry>,
    my_id: StationId,
    default_phy_mode: PhyMode,
}

impl MacRegistryProxy {
    pub fn new(
        manager: ManagerHandle,
        stations: Rc<StationRegistry>,
        my_id: StationId,
        default_phy_mode: PhyMode,
    ) -> Rc<Self> {
        Rc::new(Self {
            manager,
            stations,
            my_id,
            default_phy_mode,
        })
    }
}

impl RegistryProxy for MacRegistryProxy {
    fn user_for_cid(&self, cid: Cid) -> Option<StationId> {
        let manager = self.manager.borrow();
        let ci = manager.connection_with_id(cid)?;
        let user = match manager.station_type() {
            StationType::SubscriberStation => ci.base_station,
            _ => ci.subscriber_station,
        };
        Some(user)
    }

    fn name_for_user(&self, user: StationId) -> String {
        if user == BROADCAST_STATION {
            return "broadcast".to_string();
        }
        self.stations
            .get(user)
            .map(|station| station.name().to_string())
            .unwrap_or_else(|| format!("station {}", user))
    }

    fn my_user_id(&self) -> StationId {
        self.my_id
    }

    /// PHY mode selection per user is a link-adaptation concern
    /// outside this core; every user gets the configured default.
    fn phy_mode_for_user(&self, _user: StationId) -> PhyMode {
        self.default_phy_mode
    }
}
