//! Synthesize an AWS CloudFormation template instead of creating resources directly.
//!
//! Every created resource becomes an entry under `Resources`, keyed by a logical ID derived from
//! its name (`sidecar-publicsubnet-0-dev` becomes `SidecarPublicsubnet0Dev`). Handles carry the
//! logical ID, so references become `Ref` and `Fn::GetAtt` expressions. Where CloudFormation
//! cannot infer an ordering from those expressions, `DependsOn` is added:
//!
//! * routes to the internet gateway wait for the gateway attachment,
//! * the service waits for every listener forwarding to its target group,
//! * the scalable target waits for the service.
//!
//! A target registration is not a resource of its own: it is folded into the service's
//! `LoadBalancers` property, so the orchestrator keeps membership current as tasks come and go.

use super::{Error, Handle, Provisioner, Resource, RouteTarget, Source, Tier};
use crate::{
    assembler::{assemble, Topology},
    config::Config,
    StageFailure,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Template format version understood by CloudFormation.
pub const FORMAT_VERSION: &str = "2010-09-09";

/// Converts a resource name to a CloudFormation logical ID.
pub fn logical_id(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

fn reference(handle: &Handle) -> Value {
    json!({ "Ref": handle.id() })
}

fn attribute(handle: &Handle, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [handle.id(), attribute] })
}

fn tags(name: &str) -> Value {
    json!([{ "Key": "Name", "Value": name }])
}

/// Adds `logical_ids` to the `DependsOn` list of `body`, skipping duplicates.
fn depends_on(body: &mut Value, logical_ids: impl IntoIterator<Item = String>) {
    let Some(body) = body.as_object_mut() else {
        return;
    };
    let entry = body
        .entry("DependsOn")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(list) = entry {
        for id in logical_ids {
            let id = Value::String(id);
            if !list.contains(&id) {
                list.push(id);
            }
        }
    }
}

/// [Provisioner] that records resources as a CloudFormation template.
#[derive(Clone, Debug)]
pub struct Template {
    description: String,
    resources: BTreeMap<String, Value>,
    outputs: BTreeMap<String, Value>,
    names: HashSet<String>,
    issued: HashMap<Handle, &'static str>,
    attachments: HashMap<Handle, String>,
    listeners: HashMap<Handle, Vec<String>>,
}

impl Template {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            names: HashSet::new(),
            issued: HashMap::new(),
            attachments: HashMap::new(),
            listeners: HashMap::new(),
        }
    }

    /// Assembles the topology of `config` into a new template, including its outputs.
    pub fn synthesize(config: &Config) -> Result<(Self, Topology), StageFailure> {
        let mut template = Template::new(format!(
            "Sidecar topology for the {} environment",
            config.environment
        ));
        let topology = assemble(&mut template, config)?;
        template.outputs(&topology);
        Ok((template, topology))
    }

    /// Number of declared resources.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Returns the declaration of `logical_id`.
    pub fn resource(&self, logical_id: &str) -> Option<&Value> {
        self.resources.get(logical_id)
    }

    /// Declares the public identifiers of `topology` as exported outputs.
    pub fn outputs(&mut self, topology: &Topology) {
        let outputs = [
            (
                "LoadBalancerAddress",
                "Public DNS name of the load balancer",
                attribute(&topology.balancing.load_balancer.handle, "DNSName"),
            ),
            (
                "ClusterName",
                "Name of the cluster running the service",
                reference(&topology.compute.cluster),
            ),
            (
                "ServiceName",
                "Name of the service",
                attribute(&topology.compute.service, "Name"),
            ),
            (
                "NetworkId",
                "Identifier of the VPC",
                reference(&topology.network.id),
            ),
        ];
        for (key, description, value) in outputs {
            self.outputs.insert(
                key.to_string(),
                json!({
                    "Description": description,
                    "Value": value,
                    "Export": { "Name": { "Fn::Sub": format!("${{AWS::StackName}}-{key}") } },
                }),
            );
        }
    }

    /// Returns the complete template.
    pub fn document(&self) -> Value {
        let mut document = json!({
            "AWSTemplateFormatVersion": FORMAT_VERSION,
            "Description": self.description,
            "Resources": self.resources,
        });
        if !self.outputs.is_empty() {
            document["Outputs"] = json!(self.outputs);
        }
        document
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.document())
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.document())
    }

    fn declare(&mut self, name: &str, logical: &str, resource: Resource) -> Value {
        match resource {
            Resource::Vpc { cidr } => json!({
                "Type": "AWS::EC2::VPC",
                "Properties": {
                    "CidrBlock": cidr.to_string(),
                    "EnableDnsHostnames": true,
                    "EnableDnsSupport": true,
                    "Tags": tags(name),
                },
            }),
            Resource::InternetGateway => json!({
                "Type": "AWS::EC2::InternetGateway",
                "Properties": { "Tags": tags(name) },
            }),
            Resource::GatewayAttachment { vpc, gateway } => {
                self.attachments.insert(gateway.clone(), logical.to_string());
                json!({
                    "Type": "AWS::EC2::VPCGatewayAttachment",
                    "Properties": {
                        "VpcId": reference(&vpc),
                        "InternetGatewayId": reference(&gateway),
                    },
                })
            }
            Resource::Subnet {
                vpc,
                cidr,
                zone,
                tier,
            } => json!({
                "Type": "AWS::EC2::Subnet",
                "Properties": {
                    "VpcId": reference(&vpc),
                    "CidrBlock": cidr.to_string(),
                    "AvailabilityZone": zone,
                    "MapPublicIpOnLaunch": tier == Tier::Public,
                    "Tags": tags(name),
                },
            }),
            Resource::ElasticIp => json!({
                "Type": "AWS::EC2::EIP",
                "Properties": { "Domain": "vpc", "Tags": tags(name) },
            }),
            Resource::NatGateway { subnet, address } => json!({
                "Type": "AWS::EC2::NatGateway",
                "Properties": {
                    "SubnetId": reference(&subnet),
                    "AllocationId": attribute(&address, "AllocationId"),
                    "Tags": tags(name),
                },
            }),
            Resource::RouteTable { vpc } => json!({
                "Type": "AWS::EC2::RouteTable",
                "Properties": { "VpcId": reference(&vpc), "Tags": tags(name) },
            }),
            Resource::Route {
                table,
                destination,
                target,
            } => {
                let (key, gateway) = match &target {
                    RouteTarget::InternetGateway(gateway) => ("GatewayId", gateway),
                    RouteTarget::NatGateway(gateway) => ("NatGatewayId", gateway),
                };
                let mut body = json!({
                    "Type": "AWS::EC2::Route",
                    "Properties": {
                        "RouteTableId": reference(&table),
                        "DestinationCidrBlock": destination.to_string(),
                        key: reference(gateway),
                    },
                });
                if let Some(attachment) = self.attachments.get(gateway) {
                    depends_on(&mut body, [attachment.clone()]);
                }
                body
            }
            Resource::RouteTableAssociation { table, subnet } => json!({
                "Type": "AWS::EC2::SubnetRouteTableAssociation",
                "Properties": {
                    "RouteTableId": reference(&table),
                    "SubnetId": reference(&subnet),
                },
            }),
            Resource::SecurityGroup { vpc, description } => json!({
                "Type": "AWS::EC2::SecurityGroup",
                "Properties": {
                    "GroupDescription": description,
                    "VpcId": reference(&vpc),
                    "SecurityGroupEgress": [{ "IpProtocol": "-1", "CidrIp": "0.0.0.0/0" }],
                    "Tags": tags(name),
                },
            }),
            Resource::IngressRule {
                group,
                port,
                source,
                description,
            } => {
                let mut properties = json!({
                    "GroupId": attribute(&group, "GroupId"),
                    "IpProtocol": "tcp",
                    "FromPort": port,
                    "ToPort": port,
                    "Description": description,
                });
                match source {
                    Source::Cidr(cidr) => properties["CidrIp"] = json!(cidr.to_string()),
                    Source::Group(source) => {
                        properties["SourceSecurityGroupId"] = attribute(&source, "GroupId")
                    }
                }
                json!({ "Type": "AWS::EC2::SecurityGroupIngress", "Properties": properties })
            }
            Resource::Cluster => json!({
                "Type": "AWS::ECS::Cluster",
                "Properties": { "ClusterName": name },
            }),
            Resource::TaskDefinition {
                cpu,
                memory,
                container,
            } => {
                let environment: Vec<Value> = container
                    .environment
                    .iter()
                    .map(|(key, value)| json!({ "Name": key, "Value": value }))
                    .collect();
                json!({
                    "Type": "AWS::ECS::TaskDefinition",
                    "Properties": {
                        "Family": name,
                        "Cpu": cpu.to_string(),
                        "Memory": memory.to_string(),
                        "NetworkMode": "awsvpc",
                        "RequiresCompatibilities": ["FARGATE"],
                        "ContainerDefinitions": [{
                            "Name": container.name,
                            "Image": container.image,
                            "Essential": true,
                            "PortMappings": [{ "ContainerPort": container.port, "Protocol": "tcp" }],
                            "HealthCheck": {
                                "Command": container.readiness.command,
                                "Interval": container.readiness.interval.as_secs(),
                                "Timeout": container.readiness.timeout.as_secs(),
                                "Retries": container.readiness.retries,
                                "StartPeriod": container.readiness.start_period.as_secs(),
                            },
                            "Environment": environment,
                        }],
                    },
                })
            }
            Resource::Service {
                cluster,
                task_definition,
                desired_count,
                subnets,
                security_groups,
            } => json!({
                "Type": "AWS::ECS::Service",
                "Properties": {
                    "ServiceName": name,
                    "Cluster": reference(&cluster),
                    "TaskDefinition": reference(&task_definition),
                    "DesiredCount": desired_count,
                    "LaunchType": "FARGATE",
                    "NetworkConfiguration": {
                        "AwsvpcConfiguration": {
                            "AssignPublicIp": "DISABLED",
                            "Subnets": subnets.iter().map(reference).collect::<Vec<_>>(),
                            "SecurityGroups": security_groups
                                .iter()
                                .map(|group| attribute(group, "GroupId"))
                                .collect::<Vec<_>>(),
                        },
                    },
                },
            }),
            Resource::TargetGroup {
                vpc,
                port,
                health_check,
            } => json!({
                "Type": "AWS::ElasticLoadBalancingV2::TargetGroup",
                "Properties": {
                    "Name": name,
                    "Port": port,
                    "Protocol": "HTTP",
                    "TargetType": "ip",
                    "VpcId": reference(&vpc),
                    "HealthCheckPath": health_check.path,
                    "HealthCheckIntervalSeconds": health_check.interval.as_secs(),
                    "HealthCheckTimeoutSeconds": health_check.timeout.as_secs(),
                    "HealthyThresholdCount": health_check.healthy_threshold,
                    "UnhealthyThresholdCount": health_check.unhealthy_threshold,
                },
            }),
            Resource::LoadBalancer {
                subnets,
                security_groups,
            } => json!({
                "Type": "AWS::ElasticLoadBalancingV2::LoadBalancer",
                "Properties": {
                    "Name": name,
                    "Scheme": crate::balancer::SCHEME,
                    "Type": "application",
                    "Subnets": subnets.iter().map(reference).collect::<Vec<_>>(),
                    "SecurityGroups": security_groups
                        .iter()
                        .map(|group| attribute(group, "GroupId"))
                        .collect::<Vec<_>>(),
                },
            }),
            Resource::Listener {
                load_balancer,
                port,
                target_group,
            } => {
                self.listeners
                    .entry(target_group.clone())
                    .or_default()
                    .push(logical.to_string());
                json!({
                    "Type": "AWS::ElasticLoadBalancingV2::Listener",
                    "Properties": {
                        "LoadBalancerArn": reference(&load_balancer),
                        "Port": port,
                        "Protocol": "HTTP",
                        "DefaultActions": [{
                            "Type": "forward",
                            "TargetGroupArn": reference(&target_group),
                        }],
                    },
                })
            }
            Resource::ScalableTarget {
                service,
                cluster,
                service_name,
                min,
                max,
            } => {
                let mut body = json!({
                    "Type": "AWS::ApplicationAutoScaling::ScalableTarget",
                    "Properties": {
                        "MinCapacity": min,
                        "MaxCapacity": max,
                        "ResourceId": format!("service/{cluster}/{service_name}"),
                        "ScalableDimension": "ecs:service:DesiredCount",
                        "ServiceNamespace": "ecs",
                    },
                });
                depends_on(&mut body, [service.id().to_string()]);
                body
            }
            Resource::ScalingPolicy {
                target,
                load_balancer,
                target_group,
                requests_per_target,
                scale_in_cooldown,
                scale_out_cooldown,
            } => json!({
                "Type": "AWS::ApplicationAutoScaling::ScalingPolicy",
                "Properties": {
                    "PolicyName": name,
                    "PolicyType": "TargetTrackingScaling",
                    "ScalingTargetId": reference(&target),
                    "TargetTrackingScalingPolicyConfiguration": {
                        "TargetValue": requests_per_target,
                        "ScaleInCooldown": scale_in_cooldown.as_secs(),
                        "ScaleOutCooldown": scale_out_cooldown.as_secs(),
                        "PredefinedMetricSpecification": {
                            "PredefinedMetricType": "ALBRequestCountPerTarget",
                            "ResourceLabel": {
                                "Fn::Join": ["/", [
                                    attribute(&load_balancer, "LoadBalancerFullName"),
                                    attribute(&target_group, "TargetGroupFullName"),
                                ]],
                            },
                        },
                    },
                },
            }),
            Resource::TargetRegistration { .. } => Value::Null,
        }
    }

    /// Folds a registration into the service's `LoadBalancers` property.
    fn register(
        &mut self,
        name: &str,
        service: &Handle,
        target_group: &Handle,
        container: String,
        port: u16,
        grace_period: u64,
    ) -> Result<(), Error> {
        if self.issued.get(target_group) != Some(&"target-group") {
            return Err(Error::Rejected {
                name: name.to_string(),
                reason: format!("{} is not a target group", target_group.name()),
            });
        }
        let listeners = self.listeners.get(target_group).cloned().unwrap_or_default();
        let Some(body) = self
            .resources
            .get_mut(service.id())
            .filter(|body| body["Type"] == "AWS::ECS::Service")
        else {
            return Err(Error::Rejected {
                name: name.to_string(),
                reason: format!("{} is not a service", service.name()),
            });
        };
        let properties = &mut body["Properties"];
        let registration = json!({
            "ContainerName": container,
            "ContainerPort": port,
            "TargetGroupArn": reference(target_group),
        });
        match properties.get_mut("LoadBalancers") {
            Some(Value::Array(registrations)) => registrations.push(registration),
            _ => properties["LoadBalancers"] = json!([registration]),
        }
        properties["HealthCheckGracePeriodSeconds"] = json!(grace_period);
        depends_on(body, listeners);
        Ok(())
    }
}

impl Provisioner for Template {
    fn create(&mut self, name: &str, resource: Resource) -> Result<Handle, Error> {
        let logical = logical_id(name);
        if self.names.contains(name) || self.resources.contains_key(&logical) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        if let Some(unknown) = resource
            .references()
            .into_iter()
            .find(|handle| !self.issued.contains_key(*handle))
        {
            return Err(Error::UnknownReference(unknown.name().to_string()));
        }

        let kind = resource.kind();
        let handle = match resource {
            Resource::TargetRegistration {
                target_group,
                service,
                container,
                port,
                grace_period,
            } => {
                self.register(
                    name,
                    &service,
                    &target_group,
                    container,
                    port,
                    grace_period.as_secs(),
                )?;
                Handle::new(name, format!("{}/{}", service.id(), target_group.id()))
            }
            resource => {
                let body = self.declare(name, &logical, resource);
                self.resources.insert(logical.clone(), body);
                Handle::new(name, logical)
            }
        };
        debug!(kind, name, logical_id = handle.id(), "declared resource");
        self.names.insert(name.to_string());
        self.issued.insert(handle.clone(), kind);
        Ok(handle)
    }

    fn address(&self, load_balancer: &Handle) -> Result<String, Error> {
        match self.issued.get(load_balancer) {
            Some(&"load-balancer") => Ok(format!("${{{}.DNSName}}", load_balancer.id())),
            Some(_) => Err(Error::NotALoadBalancer(load_balancer.name().to_string())),
            None => Err(Error::UnknownReference(load_balancer.name().to_string())),
        }
    }
}
