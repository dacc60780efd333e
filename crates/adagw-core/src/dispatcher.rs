//! ---
//! gw_section: "01-core-functionality"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Routing of server commands to device modules."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use adagw_msg::{Command, CommandState, Euid};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

/// Device module families. Declaration order is the ownership precedence,
/// with the radio coordinator last as the default sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModuleKind {
    PressureSensor,
    VirtualSensor,
    Vpt,
    OpenHab,
    Jablotron,
    Bluetooth,
    MqttData,
    BelkinWemo,
    Coordinator,
}

impl ModuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleKind::PressureSensor => "pressure-sensor",
            ModuleKind::VirtualSensor => "virtual-sensor",
            ModuleKind::Vpt => "vpt",
            ModuleKind::OpenHab => "openhab",
            ModuleKind::Jablotron => "jablotron",
            ModuleKind::Bluetooth => "bluetooth",
            ModuleKind::MqttData => "mqtt-data",
            ModuleKind::BelkinWemo => "belkin-wemo",
            ModuleKind::Coordinator => "coordinator",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities a device module exposes to the core.
pub trait DeviceModule: Send + Sync {
    fn kind(&self) -> ModuleKind;

    /// Apply a server command. Must not block; modules do their own I/O.
    fn parse_command(&self, command: &Command);

    fn belongs_to(&self, euid: Euid) -> bool;

    fn owns_device_type(&self, _device_type_id: u16) -> bool {
        false
    }

    fn has_unpaired_devices(&self) -> bool {
        false
    }

    fn listens_for_pairing(&self) -> bool {
        false
    }
}

/// Where a command goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// `listen` fan-out, each module at most once, in precedence order.
    Pairing(Vec<ModuleKind>),
    /// Parameter exchange handled by the core itself.
    Parameters,
    /// First module claiming the device, or the coordinator.
    Module(ModuleKind),
    Unroutable,
}

/// Decide the destination of `command` among `modules`.
pub fn route_command(
    command: &Command,
    modules: &BTreeMap<ModuleKind, Arc<dyn DeviceModule>>,
) -> Dispatch {
    match &command.state {
        CommandState::Error => Dispatch::Unroutable,
        CommandState::Listen => {
            let targets: Vec<ModuleKind> = modules
                .iter()
                .filter(|(kind, module)| {
                    **kind == ModuleKind::Coordinator
                        || module.has_unpaired_devices()
                        || module.listens_for_pairing()
                })
                .map(|(kind, _)| *kind)
                .collect();
            if targets.is_empty() {
                Dispatch::Unroutable
            } else {
                Dispatch::Pairing(targets)
            }
        }
        state if state.is_parameter_exchange() => Dispatch::Parameters,
        _ => modules
            .iter()
            .find(|(_, module)| {
                module.belongs_to(command.euid) || module.owns_device_type(command.device_type_id)
            })
            .map(|(kind, _)| Dispatch::Module(*kind))
            .or_else(|| {
                modules
                    .contains_key(&ModuleKind::Coordinator)
                    .then_some(Dispatch::Module(ModuleKind::Coordinator))
            })
            .unwrap_or(Dispatch::Unroutable),
    }
}

/// Registry of device modules, one per [`ModuleKind`].
#[derive(Default)]
pub struct Dispatcher {
    modules: RwLock<BTreeMap<ModuleKind, Arc<dyn DeviceModule>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `module`, returning the one it replaces.
    pub fn register(&self, module: Arc<dyn DeviceModule>) -> Option<Arc<dyn DeviceModule>> {
        let kind = module.kind();
        info!(module = %kind, "device module registered");
        self.modules.write().insert(kind, module)
    }

    pub fn unregister(&self, kind: ModuleKind) -> Option<Arc<dyn DeviceModule>> {
        self.modules.write().remove(&kind)
    }

    pub fn kinds(&self) -> Vec<ModuleKind> {
        self.modules.read().keys().copied().collect()
    }

    /// Route `command` and hand it to the chosen modules.
    ///
    /// [`Dispatch::Parameters`] is only reported; the caller answers it.
    pub fn dispatch(&self, command: &Command) -> Dispatch {
        let (route, targets) = {
            let modules = self.modules.read();
            let route = route_command(command, &modules);
            let targets: Vec<Arc<dyn DeviceModule>> = match &route {
                Dispatch::Pairing(kinds) => kinds.iter().filter_map(|k| modules.get(k).cloned()).collect(),
                Dispatch::Module(kind) => modules.get(kind).cloned().into_iter().collect(),
                Dispatch::Parameters | Dispatch::Unroutable => Vec::new(),
            };
            (route, targets)
        };

        match &route {
            Dispatch::Unroutable => {
                warn!(state = %command.state, euid = command.euid, "command not routable, dropped");
            }
            Dispatch::Parameters => debug!(state = %command.state, "parameter command"),
            _ => {
                for module in targets {
                    debug!(module = %module.kind(), state = %command.state, euid = command.euid, "command dispatched");
                    module.parse_command(command);
                }
            }
        }
        route
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("modules", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FakeModule {
        kind: ModuleKind,
        owned: Vec<Euid>,
        unpaired: bool,
        listens: bool,
        seen: Mutex<Vec<CommandState>>,
    }

    impl FakeModule {
        fn new(kind: ModuleKind) -> Self {
            Self {
                kind,
                owned: Vec::new(),
                unpaired: false,
                listens: false,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn owning(mut self, euid: Euid) -> Self {
            self.owned.push(euid);
            self
        }

        fn seen(&self) -> Vec<CommandState> {
            self.seen.lock().clone()
        }
    }

    impl DeviceModule for FakeModule {
        fn kind(&self) -> ModuleKind {
            self.kind
        }

        fn parse_command(&self, command: &Command) {
            self.seen.lock().push(command.state.clone());
        }

        fn belongs_to(&self, euid: Euid) -> bool {
            self.owned.contains(&euid)
        }

        fn has_unpaired_devices(&self) -> bool {
            self.unpaired
        }

        fn listens_for_pairing(&self) -> bool {
            self.listens
        }
    }

    fn command(state: CommandState, euid: Euid) -> Command {
        Command {
            state,
            euid,
            ..Command::default()
        }
    }

    #[test]
    fn ownership_follows_precedence() {
        let dispatcher = Dispatcher::new();
        let coordinator = Arc::new(FakeModule::new(ModuleKind::Coordinator).owning(9));
        let vpt = Arc::new(FakeModule::new(ModuleKind::Vpt).owning(9));
        let pressure = Arc::new(FakeModule::new(ModuleKind::PressureSensor).owning(9));
        dispatcher.register(coordinator.clone());
        dispatcher.register(vpt.clone());
        dispatcher.register(pressure.clone());

        let route = dispatcher.dispatch(&command(CommandState::Set, 9));
        assert_eq!(route, Dispatch::Module(ModuleKind::PressureSensor));
        assert_eq!(pressure.seen(), vec![CommandState::Set]);
        assert!(vpt.seen().is_empty());
        assert!(coordinator.seen().is_empty());
    }

    #[test]
    fn unknown_device_falls_back_to_coordinator() {
        let dispatcher = Dispatcher::new();
        let coordinator = Arc::new(FakeModule::new(ModuleKind::Coordinator));
        dispatcher.register(Arc::new(FakeModule::new(ModuleKind::OpenHab).owning(1)));
        dispatcher.register(coordinator.clone());

        let route = dispatcher.dispatch(&command(CommandState::Reset, 77));
        assert_eq!(route, Dispatch::Module(ModuleKind::Coordinator));
        assert_eq!(coordinator.seen(), vec![CommandState::Reset]);
    }

    #[test]
    fn listen_fans_out_once_per_module() {
        let dispatcher = Dispatcher::new();
        let mut virtual_sensor = FakeModule::new(ModuleKind::VirtualSensor);
        virtual_sensor.unpaired = true;
        virtual_sensor.listens = true;
        let virtual_sensor = Arc::new(virtual_sensor);
        let mut openhab = FakeModule::new(ModuleKind::OpenHab);
        openhab.listens = true;
        let openhab = Arc::new(openhab);
        let jablotron = Arc::new(FakeModule::new(ModuleKind::Jablotron));
        let coordinator = Arc::new(FakeModule::new(ModuleKind::Coordinator));
        for module in [
            virtual_sensor.clone() as Arc<dyn DeviceModule>,
            openhab.clone() as Arc<dyn DeviceModule>,
            jablotron.clone() as Arc<dyn DeviceModule>,
            coordinator.clone() as Arc<dyn DeviceModule>,
        ] {
            dispatcher.register(module);
        }

        let route = dispatcher.dispatch(&command(CommandState::Listen, 0));
        assert_eq!(
            route,
            Dispatch::Pairing(vec![
                ModuleKind::VirtualSensor,
                ModuleKind::OpenHab,
                ModuleKind::Coordinator
            ])
        );
        assert_eq!(virtual_sensor.seen(), vec![CommandState::Listen]);
        assert_eq!(openhab.seen(), vec![CommandState::Listen]);
        assert_eq!(coordinator.seen(), vec![CommandState::Listen]);
        assert!(jablotron.seen().is_empty());
    }

    #[test]
    fn parameters_and_errors_skip_modules() {
        let dispatcher = Dispatcher::new();
        let coordinator = Arc::new(FakeModule::new(ModuleKind::Coordinator).owning(3));
        dispatcher.register(coordinator.clone());

        assert_eq!(
            dispatcher.dispatch(&command(CommandState::GetParameters, 3)),
            Dispatch::Parameters
        );
        assert_eq!(
            dispatcher.dispatch(&command(CommandState::Error, 3)),
            Dispatch::Unroutable
        );
        assert!(coordinator.seen().is_empty());
    }

    #[test]
    fn nothing_registered_is_unroutable() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.dispatch(&command(CommandState::Set, 1)), Dispatch::Unroutable);
        assert_eq!(dispatcher.dispatch(&command(CommandState::Listen, 0)), Dispatch::Unroutable);
    }

    #[test]
    fn registering_same_kind_replaces() {
        let dispatcher = Dispatcher::new();
        assert!(dispatcher.register(Arc::new(FakeModule::new(ModuleKind::Bluetooth))).is_none());
        assert!(dispatcher.register(Arc::new(FakeModule::new(ModuleKind::Bluetooth))).is_some());
        assert_eq!(dispatcher.kinds(), vec![ModuleKind::Bluetooth]);
        assert!(dispatcher.unregister(ModuleKind::Bluetooth).is_some());
        assert!(dispatcher.kinds().is_empty());
    }
}
