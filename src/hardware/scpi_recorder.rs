//! Generic SCPI waveform recorder
//!
//! Implements the `Instrument` capability for oscilloscopes speaking the common
//! MSO-style SCPI dialect (`:SING`, `:TRIG:STAT?`, `:WAV:DATA?` with BYTE format).
//! Firmware differences are absorbed where they are known to occur: status queries
//! are tried in several spellings and the armed-token vocabulary is left to the
//! caller (`ArmConfig::accepted_states`).
//!
//! `ScpiRecorder::open_tcp` is what `trace-daq check-recorder` uses to reach the
//! bench recorder named by `recorder.resource`.

use crate::config::{AcquireMode, ChannelConfig, TriggerConfig, TriggerSlope};
use crate::hardware::capabilities::{Calibration, Instrument};
use crate::hardware::scpi::{ScpiTransport, TcpScpiClient};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;

/// Status query spellings, tried in order until one answers.
const STATUS_QUERIES: [&str; 3] = [":TRIG:STAT?", ":TRIGGER:STATUS?", ":TRIGger:STAT?"];

/// SCPI recorder over any `ScpiTransport`.
pub struct ScpiRecorder<T: ScpiTransport> {
    transport: T,
    time_per_div_s: f64,
    segments: usize,
}

impl ScpiRecorder<TcpScpiClient> {
    /// Open a TCP connection to `resource` (`host:port`).
    pub async fn open_tcp(resource: &str, time_per_div_s: f64) -> Result<Self> {
        let transport = TcpScpiClient::connect(resource).await?;
        Ok(Self::new(transport, time_per_div_s))
    }
}

impl<T: ScpiTransport> ScpiRecorder<T> {
    /// Wrap an existing transport.
    pub fn new(transport: T, time_per_div_s: f64) -> Self {
        Self {
            transport,
            time_per_div_s,
            segments: 1,
        }
    }

    /// Borrow the transport (used by tests to inspect traffic).
    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[async_trait]
impl<T: ScpiTransport> Instrument for ScpiRecorder<T> {
    async fn connect(&mut self) -> Result<()> {
        let idn = self.transport.query("*IDN?").await?;
        tracing::info!(idn = %idn, "Recorder connected");
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        self.transport.write("*RST").await?;
        self.transport.write(":STOP").await
    }

    async fn configure_channel(&mut self, cfg: &ChannelConfig) -> Result<()> {
        let ch = &cfg.source;
        let t = &mut self.transport;
        t.write(&format!(":{ch}:DISP ON")).await?;
        t.write(&format!(":{ch}:COUP {}", cfg.coupling)).await?;
        t.write(&format!(":{ch}:PROB {}", cfg.probe)).await?;
        t.write(&format!(":{ch}:SCAL {}", cfg.vertical_scale_v))
            .await?;
        match cfg.bandwidth_limit_mhz {
            Some(mhz) => t.write(&format!(":{ch}:BWL {mhz}M")).await?,
            None => t.write(&format!(":{ch}:BWL OFF")).await?,
        }

        // Waveform transfer
        t.write(&format!(":WAV:SOUR {ch}")).await?;
        t.write(":WAV:MODE NORM").await?;
        t.write(":WAV:FORM BYTE").await
    }

    async fn configure_trigger(&mut self, cfg: &TriggerConfig) -> Result<()> {
        let slope = match cfg.slope {
            TriggerSlope::Positive => "POS",
            TriggerSlope::Negative => "NEG",
        };
        let t = &mut self.transport;
        t.write(":TRIG:MODE EDGE").await?;
        t.write(&format!(":TRIG:EDGE:SOUR {}", cfg.source)).await?;
        t.write(&format!(":TRIG:EDGE:SLOP {slope}")).await?;
        t.write(&format!(":TRIG:LEV {}", cfg.level_v)).await
    }

    async fn configure_acquisition(
        &mut self,
        mode: AcquireMode,
        points: usize,
        segments: usize,
    ) -> Result<()> {
        let t = &mut self.transport;
        match mode {
            AcquireMode::Average { count } => {
                t.write(":ACQ:TYPE AVER").await?;
                t.write(&format!(":ACQ:COUN {count}")).await?;
            }
            AcquireMode::HighRes => {
                t.write(":ACQ:TYPE NORM").await?;
                t.write(":ACQ:MODE HRES").await?;
            }
            AcquireMode::Normal => {
                t.write(":ACQ:TYPE NORM").await?;
                t.write(":ACQ:MODE NORM").await?;
            }
        }
        t.write(&format!(":ACQ:MDEP {points}")).await?;

        if segments > 1 {
            t.write(&format!(":ACQ:SEGM:COUN {segments}")).await?;
            t.write(":ACQ:SEGM:STAT ON").await?;
        } else {
            t.write(":ACQ:SEGM:STAT OFF").await?;
        }
        self.segments = segments;

        t.write(":TIM:MODE MAIN").await?;
        t.write(&format!(":TIM:SCAL {}", self.time_per_div_s))
            .await
    }

    async fn stop(&mut self) -> Result<()> {
        self.transport.write(":STOP").await
    }

    async fn request_single(&mut self) -> Result<()> {
        self.transport.write(":SING").await
    }

    async fn operation_complete(&mut self) -> Result<()> {
        let ack = self.transport.query("*OPC?").await?;
        if ack.trim() != "1" {
            bail!("Unexpected *OPC? response: {}", ack);
        }
        Ok(())
    }

    async fn query_status(&mut self) -> Result<String> {
        for query in STATUS_QUERIES {
            match self.transport.query(query).await {
                Ok(status) if !status.trim().is_empty() => {
                    return Ok(status.trim().to_uppercase());
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(query, error = %e, "Status query failed"),
            }
        }
        bail!("No status query produced a response")
    }

    async fn select_segment(&mut self, index: usize) -> Result<()> {
        if self.segments > 1 {
            // Segments are one-based on the wire
            self.transport
                .write(&format!(":ACQ:SEGM:CURR {}", index + 1))
                .await?;
        } else if index > 0 {
            bail!("Segment {} requested with segmentation disabled", index);
        }
        Ok(())
    }

    async fn query_point_count(&mut self) -> Result<Option<usize>> {
        let raw = self.transport.query(":WAV:POIN?").await?;
        let points = raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("Invalid point count '{}'", raw))?;
        Ok(Some(points))
    }

    async fn query_calibration(&mut self) -> Result<Option<Calibration>> {
        let increment = self.transport.query_f64(":WAV:YINC?").await?;
        let origin = self.transport.query_f64(":WAV:YOR?").await?;
        let reference = self.transport.query_f64(":WAV:YREF?").await?;
        Ok(Some(Calibration {
            increment,
            origin,
            reference,
        }))
    }

    async fn read_raw_block(&mut self) -> Result<Vec<u8>> {
        self.transport.query_binary(":WAV:DATA?").await
    }

    async fn disconnect(&mut self) -> Result<()> {
        // Leave the front panel running for the next user
        if let Err(e) = self.transport.write(":RUN").await {
            tracing::warn!(error = %e, "Failed to return recorder to RUN");
        }
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};

    /// Transport that records writes and answers queries from a script.
    #[derive(Default)]
    struct ScriptedTransport {
        writes: Vec<String>,
        answers: HashMap<String, VecDeque<Result<String, String>>>,
        block: Vec<u8>,
    }

    impl ScriptedTransport {
        fn answer(mut self, query: &str, response: Result<&str, &str>) -> Self {
            self.answers
                .entry(query.to_string())
                .or_default()
                .push_back(response.map(str::to_string).map_err(str::to_string));
            self
        }
    }

    #[async_trait]
    impl ScpiTransport for ScriptedTransport {
        async fn write(&mut self, command: &str) -> Result<()> {
            self.writes.push(command.to_string());
            Ok(())
        }

        async fn query(&mut self, query: &str) -> Result<String> {
            match self.answers.get_mut(query).and_then(VecDeque::pop_front) {
                Some(Ok(answer)) => Ok(answer),
                Some(Err(e)) => bail!(e),
                None => bail!("no scripted answer for {}", query),
            }
        }

        async fn query_binary(&mut self, _query: &str) -> Result<Vec<u8>> {
            Ok(self.block.clone())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn status_falls_back_to_alternate_spelling() {
        let transport = ScriptedTransport::default()
            .answer(":TRIG:STAT?", Err("undefined header"))
            .answer(":TRIGGER:STATUS?", Ok("wait"));
        let mut recorder = ScpiRecorder::new(transport, 2e-6);

        assert_eq!(recorder.query_status().await.unwrap(), "WAIT");
    }

    #[tokio::test]
    async fn status_errors_when_no_spelling_answers() {
        let mut recorder = ScpiRecorder::new(ScriptedTransport::default(), 2e-6);
        assert!(recorder.query_status().await.is_err());
    }

    #[tokio::test]
    async fn average_mode_writes_count_and_segments() {
        let mut recorder = ScpiRecorder::new(ScriptedTransport::default(), 1e-6);
        recorder
            .configure_acquisition(AcquireMode::Average { count: 16 }, 5000, 4)
            .await
            .unwrap();

        let writes = &recorder.transport().writes;
        assert!(writes.contains(&":ACQ:TYPE AVER".to_string()));
        assert!(writes.contains(&":ACQ:COUN 16".to_string()));
        assert!(writes.contains(&":ACQ:MDEP 5000".to_string()));
        assert!(writes.contains(&":ACQ:SEGM:COUN 4".to_string()));

        recorder.select_segment(2).await.unwrap();
        assert_eq!(
            recorder.transport().writes.last().map(String::as_str),
            Some(":ACQ:SEGM:CURR 3")
        );
    }

    #[tokio::test]
    async fn segment_index_rejected_without_segmentation() {
        let mut recorder = ScpiRecorder::new(ScriptedTransport::default(), 1e-6);
        assert!(recorder.select_segment(0).await.is_ok());
        assert!(recorder.select_segment(1).await.is_err());
    }

    #[tokio::test]
    async fn calibration_and_points_are_parsed() {
        let transport = ScriptedTransport::default()
            .answer(":WAV:POIN?", Ok("1000"))
            .answer(":WAV:YINC?", Ok("0.0004"))
            .answer(":WAV:YOR?", Ok("-0.01"))
            .answer(":WAV:YREF?", Ok("127"));
        let mut recorder = ScpiRecorder::new(transport, 1e-6);

        assert_eq!(recorder.query_point_count().await.unwrap(), Some(1000));
        let cal = recorder.query_calibration().await.unwrap().unwrap();
        assert_eq!(cal.reference, 127.0);
        assert!((cal.increment - 0.0004).abs() < 1e-12);
    }

    #[tokio::test]
    async fn channel_setup_honours_bandwidth_limit() {
        let mut recorder = ScpiRecorder::new(ScriptedTransport::default(), 1e-6);
        let mut cfg = ChannelConfig::default();
        cfg.bandwidth_limit_mhz = None;
        recorder.configure_channel(&cfg).await.unwrap();

        let writes = &recorder.transport().writes;
        assert!(writes.contains(&":CHAN1:BWL OFF".to_string()));
        assert!(writes.contains(&":WAV:FORM BYTE".to_string()));
    }

    #[tokio::test]
    async fn open_tcp_identifies_and_resets_recorder() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            let mut lines = Vec::new();
            for _ in 0..3 {
                let mut line = String::new();
                socket.read_line(&mut line).await.unwrap();
                if line.trim() == "*IDN?" {
                    socket.get_mut().write_all(b"ACME,MSO,0,2.1\n").await.unwrap();
                }
                lines.push(line.trim().to_string());
            }
            lines
        });

        let mut recorder = ScpiRecorder::open_tcp(&addr, 2e-6).await.unwrap();
        recorder.connect().await.unwrap();
        recorder.reset().await.unwrap();
        assert_eq!(server.await.unwrap(), vec!["*IDN?", "*RST", ":STOP"]);
    }
}
