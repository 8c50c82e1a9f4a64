use remoteiot_common::Reading;

/// Stand-in for the DHT11, DS18B20 and light sensor on the board. Values
/// drift in a small repeating pattern so dashboards have something to plot.
#[derive(Debug, Default)]
pub struct SimulatedSensors {
    tick: u64,
}

impl SimulatedSensors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&mut self, timestamp: String) -> Reading {
        self.tick = self.tick.saturating_add(1);

        // Hardware integration point: replace with real sensor drivers.
        let temp_dht11 = 22.0 + (self.tick % 8) as f64 * 0.25;
        let hum_dht11 = 40.0 + (self.tick % 6) as f64;
        let temp_ds18b20 = temp_dht11 - 0.3;
        let light_intensity = 300.0 + (self.tick % 10) as f64 * 12.0;

        Reading {
            timestamp,
            temp_dht11,
            hum_dht11,
            temp_ds18b20,
            light_intensity,
        }
    }
}
