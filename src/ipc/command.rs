//! The runtime command protocol.
//!
//! A message is an opcode string followed by zero or more arguments, all
//! separated by `\n`. Requests use the `C_` prefix, responses `R_`. The
//! first argument of every response is `RES_OK` or `RES_ERR`; on `RES_ERR`
//! the second argument is a human-readable reason.

use memchr::memchr;

use crate::error::{Error, Result};

pub const RES_OK: &str = "RES_OK";
pub const RES_ERR: &str = "RES_ERR";
pub const ARG_DELIM: u8 = b'\n';

/// The operations of the service interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    AddTask,
    AddSeries,
    Enable,
    Disable,
    Stop,
    Kill,
    Restart,
    Notify,
    Status,
    TaskList,
    Shutdown,
    GetVer,
}

static OP_NAMES: &[(Op, &str)] = &[
    (Op::AddTask, "ADDTASK"),
    (Op::AddSeries, "ADDSERIES"),
    (Op::Enable, "ENABLE"),
    (Op::Disable, "DISABLE"),
    (Op::Stop, "STOP"),
    (Op::Kill, "KILL"),
    (Op::Restart, "RESTART"),
    (Op::Notify, "NOTIFY"),
    (Op::Status, "STATUS"),
    (Op::TaskList, "TASKLIST"),
    (Op::Shutdown, "SHUTDOWN"),
    (Op::GetVer, "GETVER"),
];

/// Request (`C_*`) or response (`R_*`) form of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Request(Op),
    Response(Op),
}

impl OpCode {
    pub fn to_wire(self) -> String {
        let (prefix, op) = match self {
            OpCode::Request(op) => ("C_", op),
            OpCode::Response(op) => ("R_", op),
        };
        let name = OP_NAMES
            .iter()
            .find(|(o, _)| *o == op)
            .map(|(_, n)| *n)
            .unwrap_or("?");
        format!("{}{}", prefix, name)
    }

    pub fn parse(s: &str) -> Result<OpCode> {
        let (prefix, name) = if let Some(rest) = s.strip_prefix("C_") {
            (true, rest)
        } else if let Some(rest) = s.strip_prefix("R_") {
            (false, rest)
        } else {
            return Err(Error::InvalidArgument(format!("unknown opcode '{}'", s)));
        };
        let op = OP_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(o, _)| *o)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown opcode '{}'", s)))?;
        Ok(if prefix {
            OpCode::Request(op)
        } else {
            OpCode::Response(op)
        })
    }
}

/// A runtime command or response, ready for execution or serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtCommand {
    pub op: OpCode,
    pub args: Vec<String>,
}

impl RtCommand {
    pub fn request(op: Op, args: Vec<String>) -> RtCommand {
        RtCommand {
            op: OpCode::Request(op),
            args,
        }
    }

    /// A successful response; `extra` follows the `RES_OK` marker.
    pub fn ok_response(op: Op, extra: Vec<String>) -> RtCommand {
        let mut args = vec![RES_OK.to_string()];
        args.extend(extra);
        RtCommand {
            op: OpCode::Response(op),
            args,
        }
    }

    /// An error response with a one-line reason.
    pub fn err_response(op: Op, reason: &str) -> RtCommand {
        RtCommand {
            op: OpCode::Response(op),
            args: vec![RES_ERR.to_string(), reason.to_string()],
        }
    }

    /// Serialize to the wire form.
    pub fn to_wire(&self) -> String {
        let mut out = self.op.to_wire();
        for arg in &self.args {
            out.push(ARG_DELIM as char);
            out.push_str(arg);
        }
        out
    }

    /// Parse a wire message. Repeated delimiters are ignored.
    pub fn parse(msg: &str) -> Result<RtCommand> {
        let bytes = msg.as_bytes();
        let (op_str, rest) = match memchr(ARG_DELIM, bytes) {
            Some(pos) => (&msg[..pos], &msg[pos + 1..]),
            None => (msg, ""),
        };
        let op = OpCode::parse(op_str)?;
        let args = rest
            .split(ARG_DELIM as char)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
        Ok(RtCommand { op, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_serialize_parse_round_trip() {
        let cmd = RtCommand::request(
            Op::AddTask,
            vec!["/etc/rinit/web.task".into(), "true".into(), "@unchanged".into()],
        );
        let wire = cmd.to_wire();
        assert_eq!(wire, "C_ADDTASK\n/etc/rinit/web.task\ntrue\n@unchanged");
        assert_eq!(RtCommand::parse(&wire).unwrap(), cmd);
    }

    #[test]
    fn response_round_trip() {
        let res = RtCommand::ok_response(Op::Status, vec!["running".into(), "no".into(), "42".into()]);
        let parsed = RtCommand::parse(&res.to_wire()).unwrap();
        assert_eq!(parsed.op, OpCode::Response(Op::Status));
        assert_eq!(parsed.args[0], RES_OK);
        assert_eq!(parsed.args[3], "42");
    }

    #[test]
    fn parse_ignores_repeated_delimiters() {
        let parsed = RtCommand::parse("C_ENABLE\n\nfoo\n").unwrap();
        assert_eq!(parsed.op, OpCode::Request(Op::Enable));
        assert_eq!(parsed.args, vec!["foo"]);
    }

    #[test]
    fn unknown_opcodes_are_rejected() {
        assert!(RtCommand::parse("C_BOGUS\narg").is_err());
        assert!(RtCommand::parse("ENABLE\nfoo").is_err());
        assert!(RtCommand::parse("").is_err());
    }

    #[test]
    fn every_op_has_distinct_wire_forms() {
        let mut seen = std::collections::HashSet::new();
        for &(op, _) in OP_NAMES {
            assert!(seen.insert(OpCode::Request(op).to_wire()));
            assert!(seen.insert(OpCode::Response(op).to_wire()));
            assert_eq!(OpCode::parse(&OpCode::Request(op).to_wire()).unwrap(), OpCode::Request(op));
        }
    }
}
