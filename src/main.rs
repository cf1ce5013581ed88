use log::info;
use marstek2mqtt::{mqtt::publish_uptime, MarstekManager, MqttManager};
use std::{env, time::Duration};
use tokio::task::JoinHandle;


#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let default_filter = std::env::var("M2M_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    env::set_var("RUST_BACKTRACE", "1");

    // we need a channel for the meter poller to send its data to the handler
    let (mut mqtt, tx) = MqttManager::new().unwrap();

    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    threads.push(tokio::spawn(async move {
        mqtt.start_thread().await;
    }));

    // Start the Marstek meter poller
    let mut marstek = MarstekManager::new(tx.clone());
    threads.push(tokio::spawn(async move {
        marstek.start_thread().await;
    }));

    /* Periodic uptime publishing */
    let uptime_sender = tx.clone();
    threads.push(tokio::spawn(async move {
        // Publish immediately on startup
        publish_uptime(&uptime_sender).await;

        // Then publish every minute
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await; // Skip first immediate tick since we already published

        loop {
            interval.tick().await;
            publish_uptime(&uptime_sender).await;
        }
    }));

    info!("All modules started, now waiting for a signal to exit");
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut kill_all_tasks = false;
        for task in threads.iter() {
            if task.is_finished() {
                kill_all_tasks = true;
            }
        }

        if kill_all_tasks == true {
            for task in threads.iter_mut() {
                task.abort();
            }
            break;
        }
    }
    Ok(())
}
