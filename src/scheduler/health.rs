use chrono::{DateTime, Duration, Utc};

use crate::registry::{Device, DeviceHealth, HealthCheckPolicy, HealthDenominator};

/// Whether a health check must run on `device` before it takes ordinary jobs.
pub fn needs_health_check(device: &Device, policy: Option<&HealthCheckPolicy>, now: DateTime<Utc>) -> bool {
    let Some(policy) = policy.filter(|p| !p.disabled) else {
        return false;
    };
    match device.health() {
        DeviceHealth::Bad | DeviceHealth::Maintenance | DeviceHealth::Retired => return false,
        DeviceHealth::Unknown | DeviceHealth::Looping => return true,
        DeviceHealth::Good => {}
    }
    let Some(report) = &device.last_health_report else {
        return true;
    };
    match policy.denominator {
        HealthDenominator::Hours => {
            // A cadence too long to represent is never due.
            Duration::try_hours(i64::from(policy.frequency))
                .and_then(|period| report.submit_time.checked_add_signed(period))
                .is_some_and(|due| due < now)
        }
        HealthDenominator::Jobs => device.jobs_since_health_check >= policy.frequency,
    }
}
