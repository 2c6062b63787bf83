//! Standalone load-generation tool: publishes synthetic GPS reports to an
//! MQTT broker so the ingestion core can be exercised without real
//! devices. Independent of the main binary's module tree, same as the
//! teacher's original test publisher.

use std::time::Duration;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(about = "Publishes synthetic device reports to an MQTT broker")]
struct Args {
    #[arg(long, default_value = "tcp://localhost:1883")]
    broker_url: String,

    #[arg(long, default_value_t = 5)]
    devices: u32,

    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    #[arg(long, default_value_t = 0)]
    count: u64,

    #[arg(long, default_value = "devices/{device_id}/location")]
    topic_template: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let parsed = url::Url::parse(&args.broker_url)?;
    let host = parsed.host_str().unwrap_or("localhost").to_string();
    let port = parsed.port().unwrap_or(1883);

    let mut options = MqttOptions::new("test-publish", host, port);
    options.set_keep_alive(Duration::from_secs(30));

    let (client, mut event_loop) = AsyncClient::new(options, 100);
    tokio::spawn(async move {
        loop {
            if event_loop.poll().await.is_err() {
                break;
            }
        }
    });

    let device_ids: Vec<String> = (0..args.devices).map(|i| format!("TESTDEV{i:04}")).collect();
    let mut sent: u64 = 0;
    let mut rng = rand::thread_rng();

    loop {
        for device_id in &device_ids {
            let report = json!({
                "deviceId": device_id,
                "imei": format!("{:0<15}", format!("{device_id}")).chars().take(15).collect::<String>(),
                "latitude": 12.97 + rng.gen_range(-0.05..0.05),
                "longitude": 77.59 + rng.gen_range(-0.05..0.05),
                "speed": rng.gen_range(0.0..110.0),
                "heading": rng.gen_range(0.0..360.0),
                "ignition": if rng.gen_bool(0.7) { "ON" } else { "OFF" },
                "status": "A",
                "gsmStrength": rng.gen_range(0..31),
                "timestamp": chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            });

            let topic = args.topic_template.replace("{device_id}", device_id);
            let payload = serde_json::to_vec(&report)?;
            client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await?;
            sent += 1;
        }

        println!("published {sent} reports across {} devices", device_ids.len());

        if args.count > 0 && sent >= args.count {
            break;
        }
        tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
    }

    Ok(())
}
