//! The five configuration domains

pub mod emergency;
pub mod firewall;
pub mod group;
pub mod jail;
pub mod ssh;

pub use emergency::EmergencyCredential;
pub use firewall::FirewallExposure;
pub use group::PrivilegedGroup;
pub use jail::IntrusionJail;
pub use ssh::SshPolicy;

use crate::host::{CommandOutput, Host, Invocation};
use crate::reconcile::Reconcile;
use crate::types::ConfigurationDomain;

/// First line of every artifact hostguard renders
pub(crate) const MANAGED_HEADER: &str = "# Managed by hostguard. Local edits are overwritten.\n";

/// The reconciler for `domain`
pub fn reconciler(domain: ConfigurationDomain) -> Box<dyn Reconcile> {
    match domain {
        ConfigurationDomain::SshPolicy => Box::new(SshPolicy),
        ConfigurationDomain::FirewallExposure => Box::new(FirewallExposure),
        ConfigurationDomain::IntrusionJail => Box::new(IntrusionJail),
        ConfigurationDomain::PrivilegedGroup => Box::new(PrivilegedGroup),
        ConfigurationDomain::EmergencyCredential => Box::new(EmergencyCredential),
    }
}

/// Run a command whose failure is a step failure; `Err` carries the detail
pub(crate) async fn run_checked(
    host: &Host,
    program: &str,
    args: &[&str],
) -> Result<CommandOutput, String> {
    let invocation = Invocation::new(program, args.iter().copied());
    match host.run(program, args).await {
        Ok(output) if output.success() => Ok(output),
        Ok(output) => Err(format!("`{}` failed: {}", invocation, output.detail())),
        Err(e) => Err(format!("cannot run `{}`: {}", invocation, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciler_matches_domain() {
        for domain in ConfigurationDomain::ALL {
            assert_eq!(reconciler(domain).domain(), domain);
        }
    }
}
