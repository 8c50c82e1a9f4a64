use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};

use remoteiot_common::{BoundedSeries, DebugMessage, Reading, TemperatureSample, TimeOfDay};

const COMMAND_QUEUE_DEPTH: usize = 256;

enum StoreCommand {
    AppendReading(Reading),
    Readings {
        period: TimeOfDay,
        reply: oneshot::Sender<Vec<Reading>>,
    },
    AppendTemperature(TemperatureSample),
    Temperatures {
        period: TimeOfDay,
        reply: oneshot::Sender<Vec<TemperatureSample>>,
    },
    PushDebug(DebugMessage),
    Debug {
        reply: oneshot::Sender<Vec<DebugMessage>>,
    },
    Clear {
        reply: oneshot::Sender<usize>,
    },
    ClearYear {
        year: i32,
        reply: oneshot::Sender<usize>,
    },
}

/// Owner of every series the panel keeps. Only the actor task touches them.
struct StoreActor {
    readings: BoundedSeries<Reading>,
    temperatures: BoundedSeries<TemperatureSample>,
    debug: BoundedSeries<DebugMessage>,
}

impl StoreActor {
    async fn run(mut self, mut commands: mpsc::Receiver<StoreCommand>) {
        while let Some(command) = commands.recv().await {
            self.apply(command);
        }
    }

    fn apply(&mut self, command: StoreCommand) {
        match command {
            StoreCommand::AppendReading(reading) => {
                self.readings.push(reading);
            }
            StoreCommand::Readings { period, reply } => {
                let _ = reply.send(self.readings.filtered(period));
            }
            StoreCommand::AppendTemperature(sample) => {
                self.temperatures.push(sample);
            }
            StoreCommand::Temperatures { period, reply } => {
                let _ = reply.send(self.temperatures.filtered(period));
            }
            StoreCommand::PushDebug(message) => {
                self.debug.push(message);
            }
            StoreCommand::Debug { reply } => {
                let _ = reply.send(self.debug.snapshot());
            }
            StoreCommand::Clear { reply } => {
                let removed = self.readings.clear() + self.temperatures.clear();
                let _ = reply.send(removed);
            }
            StoreCommand::ClearYear { year, reply } => {
                let removed = self.readings.clear_year(year) + self.temperatures.clear_year(year);
                let _ = reply.send(removed);
            }
        }
    }
}

#[derive(Clone)]
pub struct StoreHandle {
    commands: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawns the actor on the current runtime.
    pub fn spawn(reading_capacity: usize, debug_capacity: usize) -> Self {
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let actor = StoreActor {
            readings: BoundedSeries::new(reading_capacity),
            temperatures: BoundedSeries::new(reading_capacity),
            debug: BoundedSeries::new(debug_capacity),
        };
        tokio::spawn(actor.run(receiver));
        Self { commands }
    }

    pub async fn append_reading(&self, reading: Reading) -> anyhow::Result<()> {
        self.send(StoreCommand::AppendReading(reading)).await
    }

    pub async fn readings(&self, period: TimeOfDay) -> anyhow::Result<Vec<Reading>> {
        self.request(|reply| StoreCommand::Readings { period, reply })
            .await
    }

    pub async fn append_temperature(&self, sample: TemperatureSample) -> anyhow::Result<()> {
        self.send(StoreCommand::AppendTemperature(sample)).await
    }

    pub async fn temperatures(&self, period: TimeOfDay) -> anyhow::Result<Vec<TemperatureSample>> {
        self.request(|reply| StoreCommand::Temperatures { period, reply })
            .await
    }

    pub async fn push_debug(&self, message: DebugMessage) -> anyhow::Result<()> {
        self.send(StoreCommand::PushDebug(message)).await
    }

    pub async fn debug(&self) -> anyhow::Result<Vec<DebugMessage>> {
        self.request(|reply| StoreCommand::Debug { reply }).await
    }

    pub async fn clear(&self) -> anyhow::Result<usize> {
        self.request(|reply| StoreCommand::Clear { reply }).await
    }

    pub async fn clear_year(&self, year: i32) -> anyhow::Result<usize> {
        self.request(|reply| StoreCommand::ClearYear { year, reply })
            .await
    }

    async fn send(&self, command: StoreCommand) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("store actor stopped"))
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> StoreCommand,
    ) -> anyhow::Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response
            .await
            .map_err(|_| anyhow!("store actor dropped the request"))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn reading(timestamp: &str, temp: f64) -> Reading {
        Reading {
            timestamp: timestamp.to_string(),
            temp_dht11: temp,
            hum_dht11: 41.0,
            temp_ds18b20: temp,
            light_intensity: 300.0,
        }
    }

    #[tokio::test]
    async fn keeps_arrival_order_and_cap() {
        let store = StoreHandle::spawn(2, 10);
        store.append_reading(reading("2024-01-01 00:00:00", 1.0)).await.unwrap();
        store.append_reading(reading("2024-01-01 00:00:01", 2.0)).await.unwrap();
        store.append_reading(reading("2024-01-01 00:00:02", 3.0)).await.unwrap();

        let temps: Vec<f64> = store
            .readings(TimeOfDay::All)
            .await
            .unwrap()
            .iter()
            .map(|r| r.temp_dht11)
            .collect();

        assert_eq!(temps, vec![2.0, 3.0]);
    }

    #[tokio::test]
    async fn clear_year_spans_readings_and_temperatures() {
        let store = StoreHandle::spawn(10, 10);
        store.append_reading(reading("2023-05-01 10:00:00", 1.0)).await.unwrap();
        store.append_reading(reading("2024-05-01 10:00:00", 2.0)).await.unwrap();
        store
            .append_temperature(TemperatureSample {
                timestamp: "2024-02-01 09:00:00".to_string(),
                temperature: 21.0,
            })
            .await
            .unwrap();

        assert_eq!(store.clear_year(2024).await.unwrap(), 2);
        assert_eq!(store.readings(TimeOfDay::All).await.unwrap().len(), 1);
        assert!(store.temperatures(TimeOfDay::All).await.unwrap().is_empty());

        assert_eq!(store.clear().await.unwrap(), 1);
        assert!(store.readings(TimeOfDay::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn debug_history_is_bounded() {
        let store = StoreHandle::spawn(10, 2);
        for text in ["a", "b", "c"] {
            store
                .push_debug(DebugMessage {
                    received_at: "2024-01-01 00:00:00".to_string(),
                    text: text.to_string(),
                })
                .await
                .unwrap();
        }

        let texts: Vec<String> = store
            .debug()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["b", "c"]);
    }
}
