//! Splitting one multinode submission into per-role sub-job definitions.
//!
//! [`split`] is a pure function of the parsed submission and the group id:
//! nothing is persisted, and the same input always yields the same output.

use serde_yaml::{Mapping, Value};

use crate::error::{Result, SchedulerError};

/// Top-level keys every sub-job inherits from the submission.
const COPIED_KEYS: &[&str] = &[
    "job_name",
    "timeouts",
    "priority",
    "visibility",
    "notify",
    "metadata",
    "reboot_to_fastboot",
];

/// Role keys that describe where a sub-job runs. They become top-level keys
/// of the sub-job instead of protocol parameters.
const SCHEDULING_KEYS: &[&str] = &["device_type", "connection", "host_role", "context"];

/// Largest number of sub-jobs one submission may create.
pub const MAX_GROUP_SIZE: u32 = 1024;

pub const MULTINODE_PROTOCOL: &str = "lava-multinode";
pub const VLAND_PROTOCOL: &str = "lava-vland";
pub const LXC_PROTOCOL: &str = "lava-lxc";

#[derive(Debug, Clone, PartialEq)]
pub struct SubJob {
    pub role: String,
    pub sub_id: u32,
    pub definition: Mapping,
}

/// Sub-jobs grouped by role, roles in submission order.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitJobs {
    pub target_group: String,
    pub group_size: u32,
    pub roles: Vec<(String, Vec<SubJob>)>,
}

impl SplitJobs {
    pub fn role(&self, name: &str) -> Option<&[SubJob]> {
        self.roles
            .iter()
            .find(|(role, _)| role == name)
            .map(|(_, jobs)| jobs.as_slice())
    }

    /// All sub-jobs in `sub_id` order.
    pub fn jobs(&self) -> impl Iterator<Item = &SubJob> {
        self.roles.iter().flat_map(|(_, jobs)| jobs.iter())
    }

    pub fn len(&self) -> usize {
        self.group_size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.group_size == 0
    }
}

struct Role<'a> {
    name: &'a str,
    settings: &'a Mapping,
    count: u32,
}

impl Role<'_> {
    fn get_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(Value::as_str)
    }
}

fn invalid(msg: impl Into<String>) -> SchedulerError {
    SchedulerError::submission(msg)
}

/// Whether the submission uses the multinode protocol.
pub fn is_multinode(submission: &Mapping) -> bool {
    submission
        .get("protocols")
        .and_then(|p| p.get(MULTINODE_PROTOCOL))
        .is_some()
}

pub fn split(submission: &Mapping, target_group: &str) -> Result<SplitJobs> {
    let protocols = submission
        .get("protocols")
        .and_then(Value::as_mapping)
        .ok_or_else(|| invalid("Missing protocols block"))?;
    let multinode = protocols
        .get(MULTINODE_PROTOCOL)
        .and_then(Value::as_mapping)
        .ok_or_else(|| invalid("Missing lava-multinode protocol"))?;
    let role_block = multinode
        .get("roles")
        .and_then(Value::as_mapping)
        .filter(|roles| !roles.is_empty())
        .ok_or_else(|| invalid("lava-multinode needs at least one role"))?;

    let roles = parse_roles(role_block)?;
    check_role_references(&roles)?;
    let group_size = roles
        .iter()
        .try_fold(0u32, |total, r| total.checked_add(r.count))
        .filter(|total| *total <= MAX_GROUP_SIZE)
        .ok_or_else(|| invalid(format!("Group size is limited to {} sub-jobs", MAX_GROUP_SIZE)))?;

    let actions = submission
        .get("actions")
        .and_then(Value::as_sequence)
        .ok_or_else(|| invalid("Missing actions"))?;
    let role_actions = assign_actions(actions, &roles)?;

    let vland = match protocols.get(VLAND_PROTOCOL) {
        Some(value) => Some(check_vland(value, &roles)?),
        None => None,
    };
    let lxc = protocols.get(LXC_PROTOCOL).and_then(Value::as_mapping);

    let shared: Vec<(&Value, &Value)> = multinode
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), Some("roles") | Some("role")))
        .collect();

    let mut sub_id = 0u32;
    let mut split = Vec::with_capacity(roles.len());
    for (role, actions) in roles.iter().zip(role_actions) {
        let mut jobs = Vec::with_capacity(role.count as usize);
        for _ in 0..role.count {
            let mut definition = Mapping::new();
            for key in COPIED_KEYS {
                if let Some(value) = submission.get(*key) {
                    definition.insert(Value::from(*key), value.clone());
                }
            }
            for key in SCHEDULING_KEYS {
                if let Some(value) = role.settings.get(*key) {
                    definition.insert(Value::from(*key), value.clone());
                }
            }

            let mut params = Mapping::new();
            params.insert("target_group".into(), target_group.into());
            params.insert("role".into(), role.name.into());
            params.insert("group_size".into(), group_size.into());
            params.insert("sub_id".into(), sub_id.into());
            for (key, value) in role.settings {
                let scheduling = key
                    .as_str()
                    .is_some_and(|k| k == "count" || SCHEDULING_KEYS.contains(&k));
                if !scheduling {
                    params.insert(key.clone(), value.clone());
                }
            }
            for (key, value) in &shared {
                params.insert((*key).clone(), (*value).clone());
            }

            let mut role_protocols = Mapping::new();
            role_protocols.insert(MULTINODE_PROTOCOL.into(), Value::Mapping(params));
            if let Some(value) = vland.and_then(|v| v.get(role.name)) {
                role_protocols.insert(VLAND_PROTOCOL.into(), value.clone());
            }
            if let Some(value) = lxc.and_then(|l| l.get(role.name)) {
                role_protocols.insert(LXC_PROTOCOL.into(), value.clone());
            }
            definition.insert("protocols".into(), Value::Mapping(role_protocols));
            definition.insert("actions".into(), Value::Sequence(actions.clone()));

            jobs.push(SubJob {
                role: role.name.to_string(),
                sub_id,
                definition,
            });
            sub_id += 1;
        }
        split.push((role.name.to_string(), jobs));
    }

    Ok(SplitJobs {
        target_group: target_group.to_string(),
        group_size,
        roles: split,
    })
}

fn parse_roles(block: &Mapping) -> Result<Vec<Role<'_>>> {
    let mut roles = Vec::with_capacity(block.len());
    for (name, settings) in block {
        let name = name
            .as_str()
            .ok_or_else(|| invalid("Role names must be strings"))?;
        let settings = settings
            .as_mapping()
            .ok_or_else(|| invalid(format!("Role '{}' must be a mapping", name)))?;
        let count = settings
            .get("count")
            .and_then(Value::as_u64)
            .filter(|c| *c >= 1)
            .ok_or_else(|| invalid(format!("Role '{}' needs a count of at least 1", name)))?;
        let count =
            u32::try_from(count).map_err(|_| invalid(format!("Role '{}' count is too large", name)))?;
        match (settings.contains_key("device_type"), settings.contains_key("connection")) {
            (true, true) => {
                return Err(invalid(format!(
                    "Role '{}' cannot declare both device_type and connection",
                    name
                )))
            }
            (false, false) => {
                return Err(invalid(format!(
                    "Role '{}' needs a device_type or a connection",
                    name
                )))
            }
            _ => {}
        }
        roles.push(Role { name, settings, count });
    }
    Ok(roles)
}

fn check_role_references(roles: &[Role<'_>]) -> Result<()> {
    let find = |name: &str| roles.iter().find(|r| r.name == name);
    for role in roles {
        if let Some(host) = role.get_str("host_role") {
            let target = find(host).ok_or_else(|| {
                invalid(format!("Role '{}' has unknown host_role '{}'", role.name, host))
            })?;
            if target.count != 1 {
                return Err(invalid(
                    "The count for a role designated as a host_role must be 1.",
                ));
            }
        }
        if let Some(expect) = role.get_str("expect_role") {
            if find(expect).is_none() {
                return Err(invalid(format!(
                    "Role '{}' expects unknown role '{}'",
                    role.name, expect
                )));
            }
        }
    }
    Ok(())
}

/// Distribute actions over roles, keeping submission order. Each copy has its
/// `role` narrowed to the single role it was assigned to.
fn assign_actions(actions: &[Value], roles: &[Role<'_>]) -> Result<Vec<Vec<Value>>> {
    let mut per_role = vec![Vec::new(); roles.len()];
    for action in actions {
        let action = action
            .as_mapping()
            .ok_or_else(|| invalid("Each action must be a mapping"))?;
        for (key, body) in action {
            let action_name = key.as_str().unwrap_or("<unnamed>");
            let targets = action_roles(action_name, body)?;
            for target in &targets {
                if !roles.iter().any(|r| r.name == *target) {
                    return Err(invalid(format!(
                        "Action '{}' refers to unknown role '{}'",
                        action_name, target
                    )));
                }
            }
            for (idx, role) in roles.iter().enumerate() {
                if !targets.contains(&role.name) {
                    continue;
                }
                let mut body = body.clone();
                if let Some(map) = body.as_mapping_mut() {
                    map.insert("role".into(), Value::from(role.name));
                }
                let mut copy = Mapping::new();
                copy.insert(key.clone(), body);
                per_role[idx].push(Value::Mapping(copy));
            }
        }
    }
    for (role, actions) in roles.iter().zip(&per_role) {
        if actions.is_empty() {
            return Err(invalid(format!("Role '{}' has no actions", role.name)));
        }
    }
    Ok(per_role)
}

fn action_roles<'a>(action_name: &str, body: &'a Value) -> Result<Vec<&'a str>> {
    let missing = || {
        invalid(format!(
            "Invalid YAML - Did not find a role in action '{}'",
            action_name
        ))
    };
    match body.get("role").ok_or_else(missing)? {
        Value::String(role) => Ok(vec![role.as_str()]),
        Value::Sequence(roles) if !roles.is_empty() => roles
            .iter()
            .map(|r| r.as_str().ok_or_else(missing))
            .collect(),
        _ => Err(missing()),
    }
}

/// VLAN metadata is per role and only makes sense for single-device roles.
fn check_vland<'a>(value: &'a Value, roles: &[Role<'_>]) -> Result<&'a Mapping> {
    let vland = value
        .as_mapping()
        .ok_or_else(|| invalid("lava-vland must be a mapping of roles"))?;
    for (name, _) in vland {
        let name = name.as_str().unwrap_or_default();
        let role = roles
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| invalid(format!("lava-vland refers to unknown role '{}'", name)))?;
        if role.count != 1 {
            return Err(invalid("vland protocol only supports one device per role."));
        }
    }
    Ok(vland)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Mapping {
        serde_yaml::from_str(text).unwrap()
    }

    const CLIENT_SERVER: &str = r#"
job_name: client-server
priority: high
timeouts:
  job: {minutes: 10}
protocols:
  lava-multinode:
    timeout: {minutes: 5}
    roles:
      client:
        device_type: qemu
        count: 2
      server:
        device_type: bbb
        count: 1
        tags: [usb]
        essential: true
actions:
- deploy:
    role: [client, server]
    to: tmpfs
- test:
    role: [server]
    definitions: []
"#;

    #[test]
    fn client_server_yields_three_sub_jobs() {
        let split = split(&parse(CLIENT_SERVER), "tg-1").unwrap();
        assert_eq!(split.group_size, 3);
        assert_eq!(split.len(), 3);
        let ids: Vec<u32> = split.jobs().map(|j| j.sub_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(split.role("server").unwrap().len(), 1);
        assert_eq!(split.role("client").unwrap().len(), 2);
    }

    #[test]
    fn sub_jobs_carry_group_params() {
        let split = split(&parse(CLIENT_SERVER), "tg-1").unwrap();
        let server = &split.role("server").unwrap()[0];
        let def = Value::Mapping(server.definition.clone());
        let params = &def["protocols"]["lava-multinode"];
        assert_eq!(params["target_group"], Value::from("tg-1"));
        assert_eq!(params["role"], Value::from("server"));
        assert_eq!(params["group_size"], Value::from(3u32));
        assert_eq!(params["sub_id"], Value::from(2u32));
        assert_eq!(params["essential"], Value::Bool(true));
        assert!(params.get("timeout").is_some());
        assert!(params.get("roles").is_none());
        assert_eq!(def["device_type"], Value::from("bbb"));
        assert_eq!(def["job_name"], Value::from("client-server"));
        assert!(def.get("count").is_none());
    }

    #[test]
    fn actions_follow_their_roles() {
        let split = split(&parse(CLIENT_SERVER), "tg-1").unwrap();
        let client = Value::Mapping(split.role("client").unwrap()[0].definition.clone());
        let server = Value::Mapping(split.role("server").unwrap()[0].definition.clone());
        assert_eq!(client["actions"].as_sequence().unwrap().len(), 1);
        let server_actions = server["actions"].as_sequence().unwrap();
        assert_eq!(server_actions.len(), 2);
        assert_eq!(
            server_actions[0]["deploy"]["role"],
            Value::from("server")
        );
    }

    #[test]
    fn split_is_deterministic() {
        let submission = parse(CLIENT_SERVER);
        assert_eq!(split(&submission, "tg").unwrap(), split(&submission, "tg").unwrap());
    }

    #[test]
    fn action_without_role_is_rejected() {
        let text = CLIENT_SERVER.replace("    role: [server]\n", "");
        let err = split(&parse(&text), "tg").unwrap_err();
        assert!(matches!(err, SchedulerError::Submission(_)));
    }

    #[test]
    fn host_role_must_have_count_one() {
        let text = r#"
protocols:
  lava-multinode:
    roles:
      host:
        device_type: qemu
        count: 2
      guest:
        connection: ssh
        host_role: host
        count: 1
actions:
- boot:
    role: [host, guest]
"#;
        let err = split(&parse(text), "tg").unwrap_err().to_string();
        assert!(err.contains("host_role must be 1"), "{}", err);
    }

    #[test]
    fn unknown_role_reference_is_rejected() {
        let text = CLIENT_SERVER.replace("role: [server]", "role: [router]");
        assert!(split(&parse(&text), "tg").is_err());
    }

    #[test]
    fn vland_metadata_stays_with_its_role() {
        let text = r#"
protocols:
  lava-multinode:
    roles:
      left:
        device_type: bbb
        count: 1
      right:
        device_type: bbb
        count: 1
  lava-vland:
    left:
      vlan_one: {tags: [10G]}
    right:
      vlan_two: {tags: [1G]}
actions:
- boot:
    role: [left, right]
"#;
        let split = split(&parse(text), "tg").unwrap();
        let left = Value::Mapping(split.role("left").unwrap()[0].definition.clone());
        let vland = left["protocols"]["lava-vland"].as_mapping().unwrap();
        assert!(vland.contains_key("vlan_one"));
        assert!(!vland.contains_key("vlan_two"));
    }

    #[test]
    fn role_cannot_have_device_type_and_connection() {
        let text = CLIENT_SERVER.replace("device_type: bbb", "device_type: bbb\n        connection: ssh");
        assert!(split(&parse(&text), "tg").is_err());
    }

    fn two_roles(count: u64) -> String {
        format!(
            "protocols:\n  lava-multinode:\n    roles:\n      a: {{device_type: qemu, count: {0}}}\n      b: {{device_type: qemu, count: {0}}}\nactions:\n- boot:\n    role: [a, b]\n",
            count
        )
    }

    #[test]
    fn overflowing_group_size_is_rejected() {
        let err = split(&parse(&two_roles(3_000_000_000)), "tg").unwrap_err();
        assert!(matches!(err, SchedulerError::Submission(_)), "{}", err);
    }

    #[test]
    fn group_size_is_capped() {
        let half = u64::from(MAX_GROUP_SIZE / 2);
        assert_eq!(split(&parse(&two_roles(half)), "tg").unwrap().group_size, MAX_GROUP_SIZE);
        let err = split(&parse(&two_roles(half + 1)), "tg").unwrap_err();
        assert!(err.to_string().contains("Group size is limited"), "{}", err);
    }
}
