use std::fs;
use std::time::Duration;

use botlink_frame::{Frame, FrameConfig, MESSAGE_BLOCKED};
use botlink_host::{HostError, RobotLink};

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{host_error, io_error, CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};
use crate::output::{print_message, OutputFormat, Received};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let payload = resolve_payload(&args)?;

    let config = FrameConfig {
        framing: args.framing,
        checksum: args.checksum,
        ..FrameConfig::default()
    };
    let mut robot = RobotLink::connect(args.addr.as_str(), config)
        .map_err(|err| host_error("connect failed", err))?;

    robot
        .send(args.type_id, &payload)
        .map_err(|err| host_error("send failed", err))?;

    let mut code = SUCCESS;
    if let Some(reply_type) = args.wait_type {
        let frame = wait_for_reply(&mut robot, reply_type, wait_timeout)
            .map_err(|err| host_error("receive failed", err))?;
        print_message(
            Received {
                from: &args.addr,
                type_id: frame.type_id,
                sequence: None,
                payload: &frame.payload,
            },
            format,
        );
        if frame.type_id == MESSAGE_BLOCKED && reply_type != MESSAGE_BLOCKED {
            code = DATA_INVALID;
        }
    }

    robot.shutdown();
    Ok(code)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(json.as_bytes().to_vec());
    }
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}

trait ReplyReceiver {
    fn recv_one_of(&mut self, types: &[u8], timeout: Duration) -> Result<Frame, HostError>;
}

impl ReplyReceiver for RobotLink {
    fn recv_one_of(&mut self, types: &[u8], timeout: Duration) -> Result<Frame, HostError> {
        self.recv_any(types, timeout)
    }
}

/// Wait for the reply type, or for the host's notice that the request type
/// was blocked.
fn wait_for_reply<R: ReplyReceiver>(
    receiver: &mut R,
    reply_type: u8,
    timeout: Duration,
) -> Result<Frame, HostError> {
    if reply_type == MESSAGE_BLOCKED {
        return receiver.recv_one_of(&[MESSAGE_BLOCKED], timeout);
    }
    receiver.recv_one_of(&[reply_type, MESSAGE_BLOCKED], timeout)
}
