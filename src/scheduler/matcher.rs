use std::collections::{BTreeMap, BTreeSet};

use crate::registry::{Device, DeviceHealth, DeviceState, Job, RequestedTarget, VlanRequest};

/// Whether the device's state and health let it take this job at all.
///
/// Health-check jobs may also run on OFFLINE or LOOPING devices, that is how
/// those devices get assessed.
pub fn is_eligible(device: &Device, job: &Job) -> bool {
    let state_ok = match device.state() {
        DeviceState::Idle => true,
        DeviceState::Offline => job.health_check,
        _ => false,
    };
    let health_ok = match device.health() {
        DeviceHealth::Good | DeviceHealth::Unknown => true,
        DeviceHealth::Looping => job.health_check,
        _ => false,
    };
    state_ok && health_ok && (!device.is_exclusive || job.exclusive)
}

fn requested(device: &Device, job: &Job) -> bool {
    match &job.requested {
        RequestedTarget::Device(hostname) => device.hostname == *hostname,
        RequestedTarget::DeviceType(device_type) => device.device_type == *device_type,
        RequestedTarget::Connection => false,
    }
}

/// Assign one interface to every requested VLAN, in request order.
///
/// Each VLAN takes the first unused interface carrying tags that cover the
/// VLAN's tags. Untagged interfaces are never used. Returns VLAN name to
/// interface name, or `None` if some VLAN cannot be placed.
pub fn match_vlan_interfaces(device: &Device, vlans: &[VlanRequest]) -> Option<BTreeMap<String, String>> {
    let mut used = BTreeSet::new();
    let mut assigned = BTreeMap::new();
    for vlan in vlans {
        let interface = device.interfaces.iter().find(|iface| {
            !used.contains(iface.name.as_str())
                && !iface.tags.is_empty()
                && vlan.tags.is_subset(&iface.tags)
        })?;
        used.insert(interface.name.as_str());
        assigned.insert(vlan.name.clone(), interface.name.clone());
    }
    Some(assigned)
}

/// Full match: eligibility, requested target, tag superset and VLAN topology.
pub fn device_matches(job: &Job, device: &Device) -> bool {
    is_eligible(device, job)
        && requested(device, job)
        && job.tags.is_subset(&device.tags)
        && (job.vlans.is_empty() || match_vlan_interfaces(device, &job.vlans).is_some())
}

fn surplus_tags(job: &Job, device: &Device) -> usize {
    device.tags.difference(&job.tags).count()
}

/// Pick the best device for a job, or `None` to leave it queued.
///
/// Among matching devices the one with the fewest tags the job did not ask
/// for wins; ties go to the earliest candidate.
pub fn select_device<'a>(job: &Job, candidates: &'a [Device]) -> Option<&'a Device> {
    candidates
        .iter()
        .filter(|device| device_matches(job, device))
        .min_by_key(|device| surplus_tags(job, device))
}
