//! End-to-end cell scenarios.
//!
//! These functions build a small cell (one base station, a few
//! subscribers) over the simulated channel and run the protocol
//! machinery for a while; the binary prints their outcome and the
//! tests assert on it.

use std::rc::Rc;

use bytes::Bytes;
use log::info;

use airlink_core::{
    Cid, ConnectionIdentifier, ConnectionType, Direction, EventScheduler, QosCategory,
};
use airlink_mac::station::StationRegistry;
use airlink_mac::{MacConfig, PhyDataTransmission, Station};

use crate::channel::{ChannelConfig, RadioChannel};

pub struct Cell {
    pub kernel: Rc<EventScheduler>,
    pub channel: Rc<RadioChannel>,
    pub registry: Rc<StationRegistry>,
    pub base_station: Rc<Station>,
    pub subscribers: Vec<Rc<Station>>,
}

/// One base station plus `num_subscribers` subscribers, all started.
pub fn build_cell(
    channel_config: ChannelConfig,
    num_subscribers: usize,
    mac_config: MacConfig,
) -> Cell {
    let kernel = EventScheduler::new();
    let registry = StationRegistry::new();
    let channel = RadioChannel::new(kernel.clone(), registry.clone(), channel_config);
    let phy: Rc<dyn PhyDataTransmission> = channel.clone();

    let base_station = Station::new_base_station(
        1,
        "BS1",
        kernel.clone(),
        phy.clone(),
        registry.clone(),
        mac_config.clone(),
    );
    base_station.register_ranging_anchor();

    let allocator = base_station.manager().borrow().cid_allocator();
    let mut subscribers = Vec::new();
    for index in 0..num_subscribers {
        let id = 2 + index as u32;
        let subscriber = Station::new_subscriber_station(
            id,
            format!("SS{}", id),
            kernel.clone(),
            phy.clone(),
            registry.clone(),
            allocator.clone(),
            mac_config.clone(),
        );
        subscribers.push(subscriber);
    }

    base_station.start();
    for subscriber in &subscribers {
        subscriber.start();
    }

    Cell {
        kernel,
        channel,
        registry,
        base_station,
        subscribers,
    }
}

/// Shortcut for the connection-setup handshake: register a data
/// connection at the base station and mirror it at the subscriber.
pub fn establish_data_connection(
    base_station: &Rc<Station>,
    subscriber: &Rc<Station>,
    direction: Direction,
    qos: QosCategory,
) -> Cid {
    let ci = base_station
        .manager()
        .borrow_mut()
        .append_connection(ConnectionIdentifier::new(
            base_station.id(),
            subscriber.id(),
            subscriber.id(),
            ConnectionType::Data,
            direction,
            qos,
        ));
    subscriber
        .manager()
        .borrow_mut()
        .append_connection(ConnectionIdentifier::with_cid(
            base_station.id(),
            ci.cid,
            subscriber.id(),
            subscriber.id(),
            ConnectionType::Data,
            direction,
            qos,
        ));
    ci.cid
}

#[derive(Debug)]
pub struct RangingOutcome {
    pub success: bool,
    pub basic_cid: Option<Cid>,
    pub primary_cid: Option<Cid>,
    pub frames_run: u32,
}

/// A subscriber ranges against the base station.
pub fn ranging_scenario(channel_config: ChannelConfig, mac_config: MacConfig) -> RangingOutcome {
    let frames = 40u32;
    let horizon = frames as f64 * mac_config.phy.frame_duration + 1e-3;
    let cell = build_cell(channel_config, 1, mac_config);
    let subscriber = &cell.subscribers[0];

    subscriber.start_ranging(cell.base_station.id());
    cell.kernel.run_until(horizon);

    let success = subscriber
        .ranging_ss()
        .expect("subscriber has a ranging role")
        .borrow()
        .result()
        == Some(true);

    let manager = cell.base_station.manager();
    let manager = manager.borrow();
    let basic_cid = manager
        .basic_connection_for_station(subscriber.id())
        .ok()
        .map(|ci| ci.cid);
    let primary_cid = manager
        .primary_connection_for(subscriber.id())
        .map(|ci| ci.cid);

    info!(
        "ranging scenario done: success={} basic={:?} primary={:?}",
        success, basic_cid, primary_cid
    );
    RangingOutcome {
        success,
        basic_cid,
        primary_cid,
        frames_run: frames,
    }
}

#[derive(Debug)]
pub struct DataOutcome {
    pub sent: usize,
    pub delivered: usize,
    pub channel_pdus: u64,
}

/// Downlink traffic from the base station to one subscriber.
pub fn downlink_data_scenario(
    channel_config: ChannelConfig,
    mac_config: MacConfig,
    payloads: usize,
) -> DataOutcome {
    let horizon = 20.0 * mac_config.phy.frame_duration;
    let cell = build_cell(channel_config, 1, mac_config);
    let subscriber = &cell.subscribers[0];

    establish_data_connection(
        &cell.base_station,
        subscriber,
        Direction::Downlink,
        QosCategory::BestEffort,
    );

    for index in 0..payloads {
        cell.base_station
            .send_data(
                subscriber.id(),
                QosCategory::BestEffort,
                Bytes::from(vec![index as u8; 100]),
            )
            .expect("downlink connection exists");
    }

    cell.kernel.run_until(horizon);

    DataOutcome {
        sent: payloads,
        delivered: subscriber.received().len(),
        channel_pdus: cell.channel.stats().pdus_sent,
    }
}

/// Uplink traffic from one subscriber to the base station, scheduled
/// through the bandwidth-request shortcut and the UL-MAP grant.
pub fn uplink_data_scenario(
    channel_config: ChannelConfig,
    mac_config: MacConfig,
    payloads: usize,
) -> DataOutcome {
    let horizon = 20.0 * mac_config.phy.frame_duration;
    let cell = build_cell(channel_config, 1, mac_config);
    let subscriber = &cell.subscribers[0];

    // the uplink master needs the subscriber's basic connection to
    // see its backlog
    let basic = cell
        .base_station
        .manager()
        .borrow_mut()
        .append_connection(ConnectionIdentifier::new(
            cell.base_station.id(),
            subscriber.id(),
            subscriber.id(),
            ConnectionType::Basic,
            Direction::Bidirectional,
            QosCategory::Signaling,
        ));
    subscriber
        .manager()
        .borrow_mut()
        .append_connection(ConnectionIdentifier::with_cid(
            cell.base_station.id(),
            basic.cid,
            subscriber.id(),
            subscriber.id(),
            ConnectionType::Basic,
            Direction::Bidirectional,
            QosCategory::Signaling,
        ));

    establish_data_connection(
        &cell.base_station,
        subscriber,
        Direction::Uplink,
        QosCategory::BestEffort,
    );

    for index in 0..payloads {
        subscriber
            .send_data(
                cell.base_station.id(),
                QosCategory::BestEffort,
                Bytes::from(vec![index as u8; 100]),
            )
            .expect("uplink connection exists");
    }

    cell.kernel.run_until(horizon);

    DataOutcome {
        sent: payloads,
        delivered: cell.base_station.received().len(),
        channel_pdus: cell.channel.stats().pdus_sent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimulationPresets;

    #[test]
    fn ranging_registers_the_signalling_connections() {
        let outcome =
            ranging_scenario(SimulationPresets::ideal_conditions(), MacConfig::default());
        assert!(outcome.success);

        let basic = outcome.basic_cid.expect("basic connection registered");
        let primary = outcome.primary_cid.expect("primary connection registered");
        assert_ne!(basic, primary);
        assert!(basic > 0);
        assert!(primary > 0);
    }

    #[test]
    fn ranging_mirrors_the_connections_at_both_stations() {
        let cell = build_cell(SimulationPresets::ideal_conditions(), 1, MacConfig::default());
        let subscriber = &cell.subscribers[0];
        subscriber.start_ranging(cell.base_station.id());
        cell.kernel.run_until(0.5);

        for station in [&cell.base_station, subscriber] {
            let manager = station.manager();
            let manager = manager.borrow();

            let ranging = manager.connection_with_id(0).expect("ranging CI exists");
            assert_eq!(ranging.connection_type, ConnectionType::InitialRanging);

            let basic = manager.basic_connection_for_station(subscriber.id()).unwrap();
            assert_eq!(basic.direction, Direction::Bidirectional);
            assert_eq!(basic.qos, QosCategory::Signaling);

            let primary = manager.primary_connection_for(subscriber.id()).unwrap();
            assert_eq!(primary.direction, Direction::Bidirectional);
            assert_eq!(primary.qos, QosCategory::Signaling);
        }

        // the CIDs carried in the RNG_RSP match at both ends
        let bs_basic = cell
            .base_station
            .manager()
            .borrow()
            .basic_connection_for_station(subscriber.id())
            .unwrap();
        let ss_basic = subscriber
            .manager()
            .borrow()
            .basic_connection_for_station(subscriber.id())
            .unwrap();
        assert_eq!(bs_basic.cid, ss_basic.cid);
    }

    #[test]
    fn downlink_payloads_reach_the_subscriber() {
        let outcome = downlink_data_scenario(
            SimulationPresets::ideal_conditions(),
            MacConfig::default(),
            3,
        );
        assert_eq!(outcome.delivered, outcome.sent);
    }

    #[test]
    fn uplink_payloads_reach_the_base_station() {
        let outcome = uplink_data_scenario(
            SimulationPresets::ideal_conditions(),
            MacConfig::default(),
            3,
        );
        assert_eq!(outcome.delivered, outcome.sent);
    }

    #[test]
    fn classified_traffic_round_trips_the_station_pair() {
        let cell = build_cell(SimulationPresets::ideal_conditions(), 1, MacConfig::default());
        let subscriber = &cell.subscribers[0];
        let cid = establish_data_connection(
            &cell.base_station,
            subscriber,
            Direction::Downlink,
            QosCategory::BestEffort,
        );

        cell.base_station
            .send_data(
                subscriber.id(),
                QosCategory::BestEffort,
                Bytes::from_static(b"ping"),
            )
            .unwrap();
        cell.kernel.run_until(0.1);

        let received = subscriber.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].cid(), Some(cid));

        // the CID resolves to the same station pair at the receiver
        let ci = subscriber
            .manager()
            .borrow()
            .connection_with_id(cid)
            .unwrap();
        assert_eq!(ci.base_station, cell.base_station.id());
        assert_eq!(ci.subscriber_station, subscriber.id());
    }

    #[test]
    fn pdus_stamped_for_a_deleted_connection_are_dropped_in_flight() {
        let cell = build_cell(SimulationPresets::ideal_conditions(), 1, MacConfig::default());
        let subscriber = &cell.subscribers[0];
        let cid = establish_data_connection(
            &cell.base_station,
            subscriber,
            Direction::Downlink,
            QosCategory::BestEffort,
        );

        cell.base_station
            .send_data(
                subscriber.id(),
                QosCategory::BestEffort,
                Bytes::from_static(b"stale"),
            )
            .unwrap();

        // run just past the downlink phase start of the first frame:
        // the PDU is on the air, not yet delivered
        let config = MacConfig::default();
        let in_flight_at = config.phy.frame_duration
            + config.phases.frame_head
            + config.phases.dl_map
            + config.phases.ul_map
            + config.phases.contention
            + 10e-6;
        cell.kernel.run_until(in_flight_at);
        assert!(subscriber.received().is_empty());

        // the connection is torn down while the PDU is in flight
        subscriber.manager().borrow_mut().delete_ci(cid);

        cell.kernel.run_until(0.5);
        assert!(subscriber.received().is_empty());
    }

    #[test]
    fn two_subscribers_share_the_uplink_grant_cycle() {
        let cell = build_cell(SimulationPresets::ideal_conditions(), 2, MacConfig::default());

        for subscriber in &cell.subscribers {
            let basic = cell
                .base_station
                .manager()
                .borrow_mut()
                .append_connection(ConnectionIdentifier::new(
                    cell.base_station.id(),
                    subscriber.id(),
                    subscriber.id(),
                    ConnectionType::Basic,
                    Direction::Bidirectional,
                    QosCategory::Signaling,
                ));
            subscriber
                .manager()
                .borrow_mut()
                .append_connection(ConnectionIdentifier::with_cid(
                    cell.base_station.id(),
                    basic.cid,
                    subscriber.id(),
                    subscriber.id(),
                    ConnectionType::Basic,
                    Direction::Bidirectional,
                    QosCategory::Signaling,
                ));
            establish_data_connection(
                &cell.base_station,
                subscriber,
                Direction::Uplink,
                QosCategory::BestEffort,
            );
            subscriber
                .send_data(
                    cell.base_station.id(),
                    QosCategory::BestEffort,
                    Bytes::from_static(b"up"),
                )
                .unwrap();
        }

        cell.kernel.run_until(0.3);
        assert_eq!(cell.base_station.received().len(), 2);
    }
}
