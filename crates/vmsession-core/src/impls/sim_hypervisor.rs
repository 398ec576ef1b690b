//! SimulatedHypervisor - 開発用のハイパーバイザー
//!
//! # 学習ポイント
//! - Mutex<HashMap> による VM テーブル
//! - 状態遷移の検証（不正な操作は InvalidState）
//! - 障害注入（テストで再試行・エラー回復を確認するため）
//!
//! # コマンド
//! | args                              | effect                          |
//! |-----------------------------------|---------------------------------|
//! | `createvm <name>`                 | registers a powered-off VM      |
//! | `modifyvm <name> [--key value]..` | stores settings                 |
//! | `showvminfo <name>`               | `Key: value` lines              |
//! | `storageattach <name> <medium>`   | attaches the boot medium        |
//! | `storagedetach <name>`            | detaches it                     |
//! | `startvm <name>`                  | powered off / saved → running   |
//! | `controlvm <name> <op>`           | poweroff, pause, resume, savestate |
//! | `discardstate <name>`             | saved → powered off             |
//! | `unregistervm <name>`             | removes the VM                  |

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use tracing::debug;
use ulid::Ulid;

use crate::domain::HvStatus;
use crate::fsm::lock;
use crate::ports::HypervisorControl;

/// Power state of a simulated VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimPower {
    PoweredOff,
    Running,
    Paused,
    Saved,
    Aborted,
}

impl SimPower {
    fn label(self) -> &'static str {
        match self {
            SimPower::PoweredOff => "powered off",
            SimPower::Running => "running",
            SimPower::Paused => "paused",
            SimPower::Saved => "saved",
            SimPower::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone)]
struct SimVm {
    uuid: String,
    power: SimPower,
    settings: BTreeMap<String, String>,
    medium: Option<String>,
}

#[derive(Default)]
struct Inner {
    vms: HashMap<String, SimVm>,
    /// Injected failures: command verb → statuses returned before real execution.
    faults: HashMap<String, VecDeque<HvStatus>>,
    history: Vec<String>,
}

/// In-memory hypervisor answering the small command set sessions use.
#[derive(Default)]
pub struct SimulatedHypervisor {
    inner: Mutex<Inner>,
}

impl SimulatedHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` invocations of `verb` fail with `status`.
    pub fn fail_next(&self, verb: &str, status: HvStatus, times: usize) {
        let mut inner = lock(&self.inner);
        let queue = inner.faults.entry(verb.to_string()).or_default();
        queue.extend(std::iter::repeat_n(status, times));
    }

    /// Change a VM's power state behind the session's back.
    pub fn force_power(&self, name: &str, power: SimPower) -> bool {
        match lock(&self.inner).vms.get_mut(name) {
            Some(vm) => {
                vm.power = power;
                true
            }
            None => false,
        }
    }

    pub fn power(&self, name: &str) -> Option<SimPower> {
        lock(&self.inner).vms.get(name).map(|vm| vm.power)
    }

    pub fn medium(&self, name: &str) -> Option<String> {
        lock(&self.inner).vms.get(name).and_then(|vm| vm.medium.clone())
    }

    pub fn setting(&self, name: &str, key: &str) -> Option<String> {
        lock(&self.inner)
            .vms
            .get(name)
            .and_then(|vm| vm.settings.get(key).cloned())
    }

    /// Every command received, joined by spaces.
    pub fn history(&self) -> Vec<String> {
        lock(&self.inner).history.clone()
    }
}

impl Inner {
    fn vm_mut(&mut self, name: &str) -> Result<&mut SimVm, HvStatus> {
        self.vms.get_mut(name).ok_or(HvStatus::NotFound)
    }

    fn transition(&mut self, name: &str, from: &[SimPower], to: SimPower) -> Result<Vec<String>, HvStatus> {
        let vm = self.vm_mut(name)?;
        if !from.contains(&vm.power) {
            return Err(HvStatus::InvalidState);
        }
        vm.power = to;
        Ok(Vec::new())
    }

    fn run(&mut self, args: &[&str]) -> Result<Vec<String>, HvStatus> {
        use SimPower::*;

        match args {
            ["createvm", name] => {
                if self.vms.contains_key(*name) {
                    return Err(HvStatus::AlreadyExists);
                }
                let uuid = Ulid::new().to_string();
                self.vms.insert(
                    name.to_string(),
                    SimVm {
                        uuid: uuid.clone(),
                        power: PoweredOff,
                        settings: BTreeMap::new(),
                        medium: None,
                    },
                );
                Ok(vec![
                    format!("Virtual machine '{name}' is created and registered."),
                    format!("UUID: {uuid}"),
                ])
            }
            ["modifyvm", name, rest @ ..] => {
                if rest.len() % 2 != 0 {
                    return Err(HvStatus::UsageError);
                }
                let vm = self.vm_mut(name)?;
                if vm.power != PoweredOff {
                    return Err(HvStatus::InvalidState);
                }
                for pair in rest.chunks(2) {
                    let key = pair[0].trim_start_matches("--");
                    vm.settings.insert(key.to_string(), pair[1].to_string());
                }
                Ok(Vec::new())
            }
            ["showvminfo", name] => {
                let vm = self.vms.get(*name).ok_or(HvStatus::NotFound)?;
                let mut lines = vec![
                    format!("Name: {name}"),
                    format!("UUID: {}", vm.uuid),
                    format!("State: {} (since 2000-01-01T00:00:00.000000000)", vm.power.label()),
                ];
                lines.extend(vm.settings.iter().map(|(k, v)| format!("{k}: {v}")));
                if let Some(medium) = &vm.medium {
                    lines.push(format!("Boot medium: {medium}"));
                }
                Ok(lines)
            }
            ["storageattach", name, medium] => {
                let vm = self.vm_mut(name)?;
                vm.medium = Some(medium.to_string());
                Ok(Vec::new())
            }
            ["storagedetach", name] => {
                let vm = self.vm_mut(name)?;
                vm.medium = None;
                Ok(Vec::new())
            }
            ["startvm", name] => {
                let vm = self.vm_mut(name)?;
                if vm.medium.is_none() && vm.power != Saved {
                    return Err(HvStatus::NotFound);
                }
                self.transition(name, &[PoweredOff, Saved, Aborted], Running)
            }
            ["controlvm", name, "poweroff"] => {
                self.transition(name, &[Running, Paused], PoweredOff)
            }
            ["controlvm", name, "pause"] => self.transition(name, &[Running], Paused),
            ["controlvm", name, "resume"] => self.transition(name, &[Paused], Running),
            ["controlvm", name, "savestate"] => self.transition(name, &[Running, Paused], Saved),
            ["discardstate", name] => self.transition(name, &[Saved], PoweredOff),
            ["unregistervm", name] => {
                let vm = self.vms.get(*name).ok_or(HvStatus::NotFound)?;
                if matches!(vm.power, Running | Paused) {
                    return Err(HvStatus::InvalidState);
                }
                self.vms.remove(*name);
                Ok(Vec::new())
            }
            _ => Err(HvStatus::UsageError),
        }
    }
}

impl HypervisorControl for SimulatedHypervisor {
    fn exec(&self, args: &[&str]) -> Result<Vec<String>, HvStatus> {
        let mut inner = lock(&self.inner);
        inner.history.push(args.join(" "));

        if let Some(verb) = args.first()
            && let Some(status) = inner.faults.get_mut(*verb).and_then(|q| q.pop_front())
        {
            debug!(command = ?args, %status, "injected failure");
            return Err(status);
        }

        let result = inner.run(args);
        debug!(command = ?args, ok = result.is_ok(), "simulated command");
        result
    }
}
