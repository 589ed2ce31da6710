use clap::Parser;
use log::{error, info};
use serde::Serialize;
use serde_json::json;
use std::error::Error;
use std::fmt::Display;
use std::path::PathBuf;
use std::process::ExitCode;

use meter_setup::config::timeout_from_secs;
use meter_setup::registers::describe;
use meter_setup::sequencer::{self, ChangeReport};
use meter_setup::{Channel, Config, GatewayFraming, MeterClient, MeterModel, MeterSession, ModbusConnector, StepError};

/// Read and configure Fineco and Eastron energy meters
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// EM115, EM737, SDM72, SDM120, SDM230 or SDM630
    #[arg(short = 'm', long)]
    meter_model: MeterModel,

    /// RS-485 adapter, e.g. /dev/ttyUSB0
    #[arg(short = 'p', long, conflicts_with = "host", required_unless_present = "host")]
    serial_port: Option<String>,

    /// Modbus gateway host
    #[arg(long)]
    host: Option<String>,

    #[arg(short = 'b', long)]
    baudrate: Option<u32>,

    #[arg(long)]
    tcp_port: Option<u16>,

    /// tcp or rtu (RTU frames tunnelled through the gateway)
    #[arg(long)]
    gateway_framing: Option<GatewayFraming>,

    #[arg(short = 'u', long, value_parser = clap::value_parser!(u8).range(1..))]
    unit_id: Option<u8>,

    /// Response timeout in seconds
    #[arg(short = 't', long)]
    timeout: Option<f64>,

    /// Defaults file, otherwise config/meter-setup.yaml or meter-setup.yaml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print results as JSON lines
    #[arg(long)]
    json: bool,

    /// Read every register the meter model defines
    #[arg(short = 'c', long)]
    curious: bool,

    #[arg(long)]
    get_baudrate: bool,

    #[arg(long, group = "set")]
    set_baudrate: Option<u32>,

    #[arg(long)]
    get_relay: bool,

    /// on, off, auto, 1 or 0
    #[arg(long, group = "set")]
    set_relay: Option<String>,

    #[arg(long)]
    get_unit_id: bool,

    #[arg(long, group = "set")]
    set_unit_id: Option<u32>,

    #[arg(long)]
    get_serial: bool,

    /// Decimal, 0x hexadecimal or 0b binary
    #[arg(long, group = "set")]
    set_serial: Option<String>,
}

/// Prints results either for humans or as one JSON object per line
struct Reporter {
    json: bool,
    failed: bool,
}

impl Reporter {
    fn value<T: Serialize + Display>(&self, operation: &str, value: &T) {
        if self.json {
            println!("{}", json!({ "operation": operation, "ok": true, "value": value }));
        } else {
            println!("{operation}: {value}");
        }
    }

    fn change<T: Serialize + Display>(&self, operation: &str, report: &ChangeReport<T>) {
        if self.json {
            println!("{}", json!({ "operation": operation, "ok": true, "before": report.before, "after": report.after }));
        } else {
            println!("{operation}: {} -> {}", report.before, report.after);
        }
    }

    fn failure(&mut self, operation: &str, e: &dyn Error) {
        self.failed = true;
        if self.json {
            println!("{}", json!({ "operation": operation, "ok": false, "error": e.to_string() }));
        } else {
            println!("{operation}: FAILED, {e}");
        }
    }

    /// A failed sequence, with the value it found before writing if it got that far
    fn step_failure(&mut self, operation: &str, e: &StepError) {
        let Some(before) = &e.before else {
            return self.failure(operation, e);
        };
        self.failed = true;
        if self.json {
            println!("{}", json!({ "operation": operation, "ok": false, "before": before, "error": e.to_string() }));
        } else {
            println!("{operation}: FAILED (was {before}), {e}");
        }
    }

    fn report<T: Serialize + Display, E: Error>(&mut self, operation: &str, result: Result<T, E>) {
        match result {
            Ok(v) => self.value(operation, &v),
            Err(e) => self.failure(operation, &e),
        }
    }

    fn report_change<T: Serialize + Display>(&mut self, operation: &str, result: Result<ChangeReport<T>, StepError>) {
        match result {
            Ok(r) => self.change(operation, &r),
            Err(e) => self.step_failure(operation, &e),
        }
    }
}

fn channel(args: &Args, config: &Config) -> Result<Channel, Box<dyn Error>> {
    if let Some(host) = &args.host {
        let framing = match args.gateway_framing {
            Some(f) => f,
            None => config.gateway_framing.parse::<GatewayFraming>()?,
        };
        return Ok(Channel::Gateway { host: host.clone(), port: args.tcp_port.unwrap_or(config.tcp_port), framing });
    }

    let path = args.serial_port.clone().ok_or("either --serial-port or --host is required")?;
    Ok(Channel::Serial { path, baudrate: args.baudrate.unwrap_or(config.baudrate) })
}

async fn run(args: Args) -> Result<bool, Box<dyn Error>> {
    let config = Config::load(args.config.as_deref())?;

    let mut session_config = config.session()?;
    if let Some(t) = args.timeout {
        session_config.timeout = timeout_from_secs(t)?;
    }

    let channel = channel(&args, &config)?;
    let unit = args.unit_id.unwrap_or(config.unit_id);
    if unit == 0 {
        return Err("unit id 0 is the broadcast address, use 1-255".into());
    }

    info!("{}", describe(meter_setup::register_map(args.meter_model)));
    let session = MeterSession::open(args.meter_model, channel, unit, session_config, Box::new(ModbusConnector)).await?;
    let mut client = MeterClient::new(session);
    let mut out = Reporter { json: args.json, failed: false };

    /* Always start with the voltage test, it tells if the wiring and line settings are right */
    match client.get_voltage().await {
        Ok(reading) if args.json => println!("{}", json!({ "operation": "voltage_test", "ok": true, "value": reading })),
        Ok(reading) => {
            let verdict = if reading.plausible { "plausible" } else { "IMPLAUSIBLE" };
            println!("voltage_test: {:.2} V ({verdict})", reading.volts);
        }
        Err(e) => out.failure("voltage_test", &e),
    }

    if args.curious {
        for (parameter, result) in client.probe_all().await {
            let unit_of_measurement = client.map().get(parameter).map(|e| e.unit_of_measurement).unwrap_or("");
            match result {
                Ok(v) if args.json => println!("{}", json!({ "operation": "curious", "parameter": parameter.name(), "value": v, "unit": unit_of_measurement })),
                Ok(v) => println!("{parameter}: {v} {unit_of_measurement}"),
                Err(e) if args.json => println!("{}", json!({ "operation": "curious", "parameter": parameter.name(), "error": e.to_string() })),
                Err(e) => println!("{parameter}: {e}"),
            }
        }
    }

    if args.get_relay {
        let result = client.get_relay_state().await;
        out.report("get_relay", result);
    }
    if let Some(requested) = &args.set_relay {
        match sequencer::set_relay_state(&mut client, requested).await {
            Ok(r) if args.json => println!("{}", json!({ "operation": "set_relay", "ok": true, "report": r })),
            Ok(r) => {
                if let (Some(serial), Some(key)) = (r.serial_number, r.key) {
                    println!("set_relay: unlock key {key} from serial number {}", serial.value());
                }
                let note = if r.skipped { " (unchanged)" } else { "" };
                println!("set_relay: {} -> {}{note}", r.before, r.after);
            }
            Err(e) => out.step_failure("set_relay", &e),
        }
    }

    if args.get_baudrate {
        let result = client.get_baudrate().await;
        out.report("get_baudrate", result);
    }
    if let Some(requested) = args.set_baudrate {
        let result = sequencer::set_baudrate(&mut client, requested).await;
        out.report_change("set_baudrate", result);
    }

    if args.get_unit_id {
        let result = client.get_unit_id().await;
        out.report("get_unit_id", result);
    }
    if let Some(requested) = args.set_unit_id {
        let result = sequencer::set_unit_id(&mut client, requested).await;
        out.report_change("set_unit_id", result);
    }

    if args.get_serial {
        let result = client.get_serial_number().await;
        out.report("get_serial", result);
    }
    if let Some(literal) = &args.set_serial {
        let result = sequencer::set_serial_number(&mut client, literal).await;
        out.report_change("set_serial", result);
    }

    client.session_mut().close().await;
    Ok(!out.failed)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Initialize logging
    let default_filter = std::env::var("METER_SETUP_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let args = Args::parse();

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e}");
            ExitCode::from(2)
        }
    }
}
