use std::process::ExitCode;
use std::sync::Arc;
use wpad_audit::config::DEFAULT_CONFIG_PATH;
use wpad_audit::{
  capture, nameservice, AuditProxy, Config, PacHost, PoisonEngine, Supervisor, Worker,
};

struct Args {
  config_path: String,
  list_devices: bool,
}

fn parse_args() -> Result<Args, String> {
  let mut args = Args {
    config_path: DEFAULT_CONFIG_PATH.to_string(),
    list_devices: false,
  };

  let mut raw = std::env::args().skip(1);
  while let Some(arg) = raw.next() {
    match arg.as_str() {
      "--config" => {
        args.config_path = raw
          .next()
          .ok_or_else(|| "--config requires a path".to_string())?;
      }
      "--list-devices" => args.list_devices = true,
      "--help" | "-h" => {
        return Err(format!(
          "usage: wpad-audit [--config <path>] [--list-devices]\n\
           default config path: {}",
          DEFAULT_CONFIG_PATH
        ));
      }
      other => return Err(format!("unknown argument: {}", other)),
    }
  }
  Ok(args)
}

fn print_device_inventory() {
  match capture::list_devices() {
    Ok(devices) if devices.is_empty() => {
      eprintln!("no capture devices found (is the capture driver installed?)");
    }
    Ok(devices) => {
      eprintln!("available capture devices:");
      for device in devices {
        eprintln!("  {}", device);
      }
    }
    Err(e) => eprintln!("unable to list capture devices: {}", e),
  }
}

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "wpad_audit=info".into()),
    )
    .init();

  let args = match parse_args() {
    Ok(args) => args,
    Err(message) => {
      eprintln!("{}", message);
      return ExitCode::FAILURE;
    }
  };

  if args.list_devices {
    print_device_inventory();
    return ExitCode::SUCCESS;
  }

  let config = match Config::load(&args.config_path) {
    Ok(config) => config,
    Err(e) => {
      tracing::error!("unable to load {}: {}", args.config_path, e);
      return ExitCode::FAILURE;
    }
  };

  let Some(device) = config.device.clone() else {
    eprintln!("no capture device configured; set \"device\" to one of:");
    print_device_inventory();
    return ExitCode::FAILURE;
  };

  let device_ip = match capture::device_ipv4(&device, false) {
    Ok(Some(ip)) => ip,
    Ok(None) | Err(_) => {
      eprintln!("unable to resolve an IPv4 address for {}; pick one of:", device);
      print_device_inventory();
      return ExitCode::FAILURE;
    }
  };

  let source_mac = match &config.capture_mac {
    Some(mac) => match wpad_audit::config::parse_mac(mac) {
      Ok(mac) => mac,
      Err(_) => return ExitCode::FAILURE,
    },
    None => match capture::device_mac(&device) {
      Ok(mac) => mac,
      Err(_) => return ExitCode::FAILURE,
    },
  };

  // Make every client on the segment re-resolve WPAD while we listen.
  if !nameservice::flush().await {
    tracing::warn!("some name-service caches could not be flushed");
  }

  let proxy_endpoint = config.proxy_endpoint(device_ip);
  let pac = PacHost::new(
    config.pac_endpoint(device_ip),
    proxy_endpoint,
    &config.hosts_to_proxy,
    config.deny_processes.clone(),
  );
  tracing::info!("serving the autoconfiguration script:\n{}", pac.script());

  let proxy = AuditProxy::new(
    proxy_endpoint,
    config.enable_local_proxy,
    config.deny_processes.clone(),
  );
  let engine = PoisonEngine::new(
    device,
    source_mac,
    device_ip,
    config.capture_read_timeout_ms,
  );

  let workers: Vec<Arc<dyn Worker>> = vec![Arc::new(pac), Arc::new(proxy), Arc::new(engine)];
  let result = Supervisor::new(workers).run().await;

  // Let clients fall back to their normal resolution path.
  if !nameservice::flush().await {
    tracing::warn!("some name-service caches could not be restored");
  }

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      tracing::error!("audit session failed: {}", e);
      ExitCode::FAILURE
    }
  }
}
