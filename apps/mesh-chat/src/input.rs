/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Say(String),
    Peers,
    Status,
    Refresh,
    Reconnect,
    Clear,
    Connect(String),
    Help,
    Quit,
    Unknown(String),
}

pub const HELP: &str = "\
/peers            list connected peers
/status           print the session snapshot as json
/connect <id>     dial a peer by id
/refresh          drop every connection and rediscover
/reconnect        re-register with a new identity
/clear            clear the message log
/quit             leave
anything else is broadcast to the mesh";

pub fn parse(line: &str) -> ChatCommand {
    let Some(rest) = line.trim_start().strip_prefix('/') else {
        return ChatCommand::Say(line.to_string());
    };
    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    match name {
        "peers" => ChatCommand::Peers,
        "status" => ChatCommand::Status,
        "refresh" => ChatCommand::Refresh,
        "reconnect" => ChatCommand::Reconnect,
        "clear" => ChatCommand::Clear,
        "help" => ChatCommand::Help,
        "quit" | "exit" => ChatCommand::Quit,
        "connect" => match parts.next() {
            Some(peer) => ChatCommand::Connect(peer.to_string()),
            None => ChatCommand::Unknown("usage: /connect <peer id>".into()),
        },
        other => ChatCommand::Unknown(format!("unknown command /{other}")),
    }
}
