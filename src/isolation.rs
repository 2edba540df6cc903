//! Routines for configuring the isolation module and the interfaces it sits on.
//!
//! All of these go through `RemoteSession::run`, so they are batched when the session is
//! delayed and only logged during dry runs. They require root on the host.

use log::warn;

use crate::config::ModuleConfig;
use crate::error::RunnerError;
use crate::session::RemoteSession;
use crate::tenant::{Tenant, TenantId};

/// Where the module exposes its control files.
fn control_dir(module: &ModuleConfig) -> String {
    format!("/sys/module/{}/parameters", module.name)
}

/// Unload the module if it is loaded.
pub fn rmmod(shell: &mut RemoteSession, module: &ModuleConfig) -> Result<(), RunnerError> {
    shell.run(&format!(
        "if lsmod | grep -q '^{0} '; then rmmod {0}; fi",
        module.name
    ))?;
    Ok(())
}

/// Load the module on the isolation device of the host.
pub fn insmod(shell: &mut RemoteSession, module: &ModuleConfig) -> Result<(), RunnerError> {
    let cmd = format!("insmod {} iso_param_dev={}", module.path, shell.dev());
    shell.run(&cmd)?;
    Ok(())
}

/// Set a module parameter, e.g. `ISO_VQ_DRAIN_RATE_MBPS`.
pub fn set_param(
    shell: &mut RemoteSession,
    module: &ModuleConfig,
    name: &str,
    value: &str,
) -> Result<(), RunnerError> {
    shell.run(&format!("echo {} > /proc/sys/{}/{}", value, module.name, name))?;
    Ok(())
}

/// Turn off segmentation offloads (the module sees every packet) and bring the device up.
pub fn prepare_iface(shell: &mut RemoteSession) -> Result<(), RunnerError> {
    let cmd = format!(
        "ethtool -K {0} tso off gso off gro off lro off 2>/dev/null; ifconfig {0} up",
        shell.dev()
    );
    shell.run(&cmd)?;
    Ok(())
}

/// Remove any root queueing discipline. There may not be one, so this never fails on exit
/// status.
pub fn remove_qdiscs(shell: &mut RemoteSession) -> Result<(), RunnerError> {
    let cmd = format!("tc qdisc del dev {} root 2>/dev/null", shell.dev());
    shell.run_lenient(&cmd)?;
    Ok(())
}

pub fn set_mtu(shell: &mut RemoteSession, mtu: u32) -> Result<(), RunnerError> {
    let cmd = format!("ifconfig {} mtu {}", shell.dev(), mtu);
    shell.run(&cmd)?;
    Ok(())
}

/// Kill every process with one of the given (space separated) names.
pub fn killall(shell: &mut RemoteSession, names: &str) -> Result<(), RunnerError> {
    shell.run_lenient(&format!("killall -9 {} 2>/dev/null", names))?;
    Ok(())
}

/// Flush iptables and ebtables rules.
pub fn ipt_ebt_flush(shell: &mut RemoteSession) -> Result<(), RunnerError> {
    shell.run("iptables -F; ebtables -F")?;
    Ok(())
}

/// Spread receive processing of the isolation device over all CPUs.
pub fn configure_rps(shell: &mut RemoteSession) -> Result<(), RunnerError> {
    let cmd = format!(
        "for f in /sys/class/net/{}/queues/rx-*/rps_cpus; do echo ffff > $f; done",
        shell.dev()
    );
    shell.run(&cmd)?;
    Ok(())
}

/// Bind the address of tenant `id` as an alias on the isolation device, without creating any
/// module state. Useful when something other than the module (e.g. HTB) classifies traffic.
pub fn create_alias_tenant(shell: &mut RemoteSession, id: TenantId) -> Result<Tenant, RunnerError> {
    let tenant = Tenant::new(shell.data_ip()?, id);

    // Tracked before the alias exists: if only the alias fails, teardown still has to clean up
    // whatever the caller created for the tenant.
    shell.add_tenant(tenant);

    let cmd = format!(
        "ifconfig {}:{} {} netmask 255.255.0.0 up",
        shell.dev(),
        tenant.id,
        tenant.ip
    );
    shell.run(&cmd)?;

    Ok(tenant)
}

/// Create an IP tenant: a tx class and a virtual queue keyed by the tenant address, associated
/// with each other, plus the address alias. `weight` applies to both.
pub fn create_ip_tenant(
    shell: &mut RemoteSession,
    module: &ModuleConfig,
    id: TenantId,
    weight: Option<u32>,
) -> Result<Tenant, RunnerError> {
    let tenant = Tenant::new(shell.data_ip()?, id);
    let ctl = control_dir(module);

    // Tracked before the first write, so that a partly created tenant is still removed.
    shell.add_tenant(tenant);

    shell.run(&format!("echo -n {} > {}/create_txc", tenant.ip, ctl))?;
    shell.run(&format!("echo -n {} > {}/create_vq", tenant.ip, ctl))?;
    shell.run(&format!(
        "echo -n associate txc {0} vq {0} > {1}/assoc_txc_vq",
        tenant.ip, ctl
    ))?;
    if let Some(weight) = weight {
        shell.run(&format!(
            "echo -n {} weight {} > {}/set_txc_weight",
            tenant.ip, weight, ctl
        ))?;
        shell.run(&format!(
            "echo -n {} weight {} > {}/set_vq_weight",
            tenant.ip, weight, ctl
        ))?;
    }

    create_alias_tenant(shell, id)
}

/// Create a tenant with only a tx class (for rate limiting on the sender).
pub fn create_tx_tenant(
    shell: &mut RemoteSession,
    module: &ModuleConfig,
    id: TenantId,
) -> Result<Tenant, RunnerError> {
    let tenant = Tenant::new(shell.data_ip()?, id);
    let ctl = control_dir(module);

    shell.add_tenant(tenant);

    shell.run(&format!("echo -n {} > {}/create_txc", tenant.ip, ctl))?;
    create_alias_tenant(shell, id)
}

/// Remove every tenant created on the host, newest first. Every tenant is attempted; the first
/// failure is returned after all have been tried.
pub fn remove_tenants(shell: &mut RemoteSession, module: &ModuleConfig) -> Result<(), RunnerError> {
    let ctl = control_dir(module);
    let mut first_err = None;

    for tenant in shell.take_tenants().into_iter().rev() {
        let cmd = format!(
            "ifconfig {dev}:{id} down 2>/dev/null; \
             (test ! -e {ctl}/delete_txc || echo -n {ip} > {ctl}/delete_txc) && \
             (test ! -e {ctl}/delete_vq || echo -n {ip} > {ctl}/delete_vq)",
            dev = shell.dev(),
            id = tenant.id,
            ip = tenant.ip,
            ctl = ctl,
        );
        if let Err(e) = shell.run(&cmd) {
            warn!("{}: failed to remove tenant {}: {}", shell.addr(), tenant.id, e);
            first_err.get_or_insert(e);
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Replace the root qdisc with an HTB with one class per tenant at `rate_mbit`, each fed by a
/// u32 filter on the tenant's source address. Sent as one delayed batch.
pub fn configure_htb(
    shell: &mut RemoteSession,
    rate_mbit: u64,
    tenants: &[Tenant],
) -> Result<(), RunnerError> {
    let dev = shell.dev().to_owned();
    let was_delayed = shell.is_delayed();

    shell.set_delayed(true)?;
    shell.run(&format!("tc qdisc del dev {} root 2>/dev/null || true", dev))?;
    shell.run(&format!(
        "tc qdisc add dev {} root handle 1: htb default 1000",
        dev
    ))?;
    for tenant in tenants.iter() {
        shell.run(&format!(
            "tc class add dev {} parent 1: classid 1:{} htb rate {}Mbit mtu 64000",
            dev, tenant.id, rate_mbit
        ))?;
        shell.run(&format!(
            "tc filter add dev {} parent 1: protocol ip prio 1 u32 match ip src {} classid 1:{}",
            dev, tenant.ip, tenant.id
        ))?;
    }

    if !was_delayed {
        shell.set_delayed(false)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use crate::config::HostConfig;
    use crate::testing::Recorder;

    fn session(recorder: &Recorder) -> RemoteSession {
        RemoteSession::new(
            HostConfig::new("10.0.1.2"),
            Arc::new(recorder.transport("10.0.1.2")),
        )
    }

    #[test]
    fn tenants_are_tracked_and_removed() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let mut s = session(&rec);
        let module = ModuleConfig::default();

        let t1 = create_ip_tenant(&mut s, &module, TenantId::new(1)?, None)?;
        let t2 = create_ip_tenant(&mut s, &module, TenantId::new(2)?, Some(4))?;
        assert_eq!(t1.ip, Ipv4Addr::new(11, 1, 1, 2));
        assert_eq!(s.tenants(), &[t1, t2]);

        let cmds = rec.commands("10.0.1.2");
        assert!(cmds.contains(&"ifconfig eth2:2 11.2.1.2 netmask 255.255.0.0 up".to_owned()));
        assert!(cmds
            .iter()
            .any(|c| c.contains("11.2.1.2 weight 4") && c.ends_with("set_txc_weight")));

        remove_tenants(&mut s, &module)?;
        assert!(s.tenants().is_empty());

        let cmds = rec.commands("10.0.1.2");
        let removals: Vec<_> = cmds.iter().filter(|c| c.contains("delete_txc")).collect();
        assert_eq!(removals.len(), 2);
        // Newest first.
        assert!(removals[0].contains("11.2.1.2"));
        assert!(removals[1].contains("11.1.1.2"));

        Ok(())
    }

    #[test]
    fn tenant_removal_continues_past_failures() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let mut s = session(&rec);
        let module = ModuleConfig::default();

        for t in 1..=3 {
            create_ip_tenant(&mut s, &module, TenantId::new(t)?, None)?;
        }
        rec.fail_on("10.0.1.2", "eth2:2 down");

        assert!(remove_tenants(&mut s, &module).is_err());
        assert!(s.tenants().is_empty());
        let removals = rec
            .commands("10.0.1.2")
            .into_iter()
            .filter(|c| c.contains("delete_txc"))
            .count();
        assert_eq!(removals, 3);

        Ok(())
    }

    #[test]
    fn failed_creation_is_still_removed() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let mut s = session(&rec);
        let module = ModuleConfig::default();

        rec.fail_on("10.0.1.2", "create_vq");
        assert!(create_ip_tenant(&mut s, &module, TenantId::new(1)?, None).is_err());
        assert_eq!(s.tenants().len(), 1);

        remove_tenants(&mut s, &module)?;
        let removals: Vec<_> = rec
            .commands("10.0.1.2")
            .into_iter()
            .filter(|c| c.contains("delete_txc"))
            .collect();
        assert_eq!(removals.len(), 1);
        assert!(removals[0].contains("echo -n 11.1.1.2 > /sys/module/perfiso/parameters/delete_txc"));

        Ok(())
    }

    #[test]
    fn htb_is_one_batch() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let mut s = session(&rec);
        let tenants: Vec<_> = (1..=2)
            .map(|t| -> Result<_, RunnerError> {
                Ok(Tenant::new(Ipv4Addr::new(10, 0, 1, 2), TenantId::new(t)?))
            })
            .collect::<Result<_, _>>()?;

        configure_htb(&mut s, 500, &tenants)?;

        let cmds = rec.commands("10.0.1.2");
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].starts_with("{ tc qdisc del dev eth2 root 2>/dev/null || true; } && "));
        assert!(cmds[0].contains("classid 1:2 htb rate 500Mbit"));
        assert!(cmds[0].ends_with("match ip src 11.2.1.2 classid 1:2; }"));
        assert!(!s.is_delayed());

        Ok(())
    }

    #[test]
    fn module_commands() -> Result<(), failure::Error> {
        let rec = Recorder::new();
        let mut s = session(&rec);
        let module = ModuleConfig::default();

        rmmod(&mut s, &module)?;
        insmod(&mut s, &module)?;
        set_param(&mut s, &module, "ISO_VQ_DRAIN_RATE_MBPS", "8500")?;

        assert_eq!(
            rec.commands("10.0.1.2"),
            vec![
                "if lsmod | grep -q '^perfiso '; then rmmod perfiso; fi".to_owned(),
                "insmod /root/perfiso/perfiso.ko iso_param_dev=eth2".to_owned(),
                "echo 8500 > /proc/sys/perfiso/ISO_VQ_DRAIN_RATE_MBPS".to_owned(),
            ]
        );

        Ok(())
    }
}
