//! Built-in status templates
//!
//! Each renders a YAML document of the same shape as the target object's
//! status subresource. Users can replace any of them from a file at
//! startup; these defaults produce a plausible Running pod and a Ready
//! node.

/// Pod status: phase Running, one container status per container in the
/// spec, addresses and times filled in by the controller.
pub const POD_STATUS_TEMPLATE: &str = r#"conditions:
- lastTransitionTime: ${now}
  status: "True"
  type: Initialized
- lastTransitionTime: ${now}
  status: "True"
  type: Ready
- lastTransitionTime: ${now}
  status: "True"
  type: ContainersReady
- lastTransitionTime: ${now}
  status: "True"
  type: PodScheduled
containerStatuses:
{%- for container in pod.spec.containers %}
- image: ${container.image}
  name: ${container.name}
  ready: true
  restartCount: 0
  started: true
  state:
    running:
      startedAt: ${now}
{%- endfor %}
hostIP: ${nodeIP}
podIP: ${podIP}
phase: Running
startTime: ${now}
"#;

/// Node initialization: addresses, capacity, node info and Ready
/// conditions written once when a node is claimed.
pub const NODE_INITIALIZATION_TEMPLATE: &str = r#"addresses:
- address: ${nodeIP}
  type: InternalIP
allocatable:
  cpu: 1k
  memory: 1Ti
  pods: 1M
capacity:
  cpu: 1k
  memory: 1Ti
  pods: 1M
conditions:
- lastHeartbeatTime: ${now}
  lastTransitionTime: ${now}
  message: kubelet is posting ready status
  reason: KubeletReady
  status: "True"
  type: Ready
- lastHeartbeatTime: ${now}
  lastTransitionTime: ${now}
  message: kubelet has sufficient memory available
  reason: KubeletHasSufficientMemory
  status: "False"
  type: MemoryPressure
- lastHeartbeatTime: ${now}
  lastTransitionTime: ${now}
  message: kubelet has no disk pressure
  reason: KubeletHasNoDiskPressure
  status: "False"
  type: DiskPressure
- lastHeartbeatTime: ${now}
  lastTransitionTime: ${now}
  message: kubelet has sufficient PID available
  reason: KubeletHasSufficientPID
  status: "False"
  type: PIDPressure
- lastHeartbeatTime: ${now}
  lastTransitionTime: ${now}
  message: RouteController created a route
  reason: RouteCreated
  status: "False"
  type: NetworkUnavailable
daemonEndpoints:
  kubeletEndpoint:
    Port: 10250
nodeInfo:
  architecture: amd64
  bootID: ""
  containerRuntimeVersion: ""
  kernelVersion: ""
  kubeProxyVersion: ${version}
  kubeletVersion: ${version}
  machineID: ""
  operatingSystem: linux
  osImage: ""
  systemUUID: ""
phase: Running
"#;

/// Node heartbeat: refreshes condition heartbeat times, asserting the
/// node is still alive.
pub const NODE_HEARTBEAT_TEMPLATE: &str = r#"conditions:
- lastHeartbeatTime: ${now}
  lastTransitionTime: ${now}
  message: kubelet is posting ready status
  reason: KubeletReady
  status: "True"
  type: Ready
- lastHeartbeatTime: ${now}
  lastTransitionTime: ${now}
  message: kubelet has sufficient memory available
  reason: KubeletHasSufficientMemory
  status: "False"
  type: MemoryPressure
- lastHeartbeatTime: ${now}
  lastTransitionTime: ${now}
  message: kubelet has no disk pressure
  reason: KubeletHasNoDiskPressure
  status: "False"
  type: DiskPressure
- lastHeartbeatTime: ${now}
  lastTransitionTime: ${now}
  message: kubelet has sufficient PID available
  reason: KubeletHasSufficientPID
  status: "False"
  type: PIDPressure
- lastHeartbeatTime: ${now}
  lastTransitionTime: ${now}
  message: RouteController created a route
  reason: RouteCreated
  status: "False"
  type: NetworkUnavailable
"#;
