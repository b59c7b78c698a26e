//! Cell simulation driver for Airlink

use anyhow::Result;
use bytes::Bytes;
use colored::Colorize;
use indicatif::ProgressBar;

use airlink_core::{Direction, QosCategory};
use airlink_mac::MacConfig;
use airlink_sim::{scenarios, SimulationPresets};

fn main() -> Result<()> {
    env_logger::init();

    println!("{}", "Airlink MAC Simulation".bright_blue().bold());
    println!("{}", "======================".bright_blue());
    println!();

    let presets = vec![
        ("Good Conditions", SimulationPresets::good_conditions()),
        ("Average Conditions", SimulationPresets::average_conditions()),
        ("Poor Conditions", SimulationPresets::poor_conditions()),
    ];

    for (name, channel) in presets {
        println!("{}", format!("\n>>> Testing: {}", name).bright_green().bold());
        println!("Packet loss: {}%", (channel.loss_probability * 100.0) as u32);
        println!("Latency: {}us", (channel.latency * 1e6) as u32);
        println!();

        let ranging = scenarios::ranging_scenario(channel.clone(), MacConfig::default());
        if ranging.success {
            println!(
                "{} basic CID {:?}, primary CID {:?}",
                "✓ Ranging complete:".green(),
                ranging.basic_cid,
                ranging.primary_cid
            );
        } else {
            println!(
                "{} no response within {} frames",
                "✗ Ranging failed:".red(),
                ranging.frames_run
            );
        }

        let downlink = scenarios::downlink_data_scenario(channel.clone(), MacConfig::default(), 20);
        println!(
            "Downlink: {}/{} payloads delivered ({} PDUs on the air)",
            downlink.delivered, downlink.sent, downlink.channel_pdus
        );

        let uplink = scenarios::uplink_data_scenario(channel, MacConfig::default(), 20);
        println!(
            "Uplink:   {}/{} payloads delivered ({} PDUs on the air)",
            uplink.delivered, uplink.sent, uplink.channel_pdus
        );

        println!("{}", "-".repeat(50));
    }

    println!(
        "{}",
        "\n>>> Frame-by-frame demo: 2 subscribers, ideal channel"
            .bright_yellow()
            .bold()
    );

    let mac_config = MacConfig::default();
    let frame_duration = mac_config.phy.frame_duration;
    let cell = scenarios::build_cell(SimulationPresets::ideal_conditions(), 2, mac_config);

    for subscriber in &cell.subscribers {
        scenarios::establish_data_connection(
            &cell.base_station,
            subscriber,
            Direction::Downlink,
            QosCategory::BestEffort,
        );
        for index in 0..10u8 {
            cell.base_station.send_data(
                subscriber.id(),
                QosCategory::BestEffort,
                Bytes::from(vec![index; 100]),
            )?;
        }
    }

    let frames = 30u64;
    let progress = ProgressBar::new(frames);
    for frame in 0..frames {
        cell.kernel.run_until((frame + 1) as f64 * frame_duration);
        progress.inc(1);
    }
    progress.finish_with_message("simulation complete");

    for subscriber in &cell.subscribers {
        println!(
            "{} received {} payloads",
            subscriber.name(),
            subscriber.received().len()
        );
    }
    let stats = cell.channel.stats();
    println!(
        "Channel: {} PDUs, {} bits, {} dropped",
        stats.pdus_sent, stats.bits_sent, stats.pdus_dropped
    );

    println!("\n{}", "All simulations complete!".bright_green().bold());
    Ok(())
}
