//! Synchronous netlink link operations
//!
//! Thin blocking facade over rtnetlink. The launcher's intermediate and
//! grandchild are forked single-threaded processes, so each facade owns a
//! fresh current-thread runtime driving one netlink connection.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use futures::TryStreamExt;
use log::debug;
use rtnetlink::packet_route::link::{InfoData, InfoIpVlan, InfoKind, IpVlanMode, LinkAttribute, MacVlanMode};
use rtnetlink::{Handle, LinkMacVlan, LinkMessageBuilder, LinkUnspec, LinkVeth, RouteMessageBuilder};
use tokio::runtime::Runtime;

use crate::errors::{Result, TaskError};
use crate::network::parse_hw;

/// Blocking netlink handle bound to the calling process's network
/// namespace at connect time
pub struct NetLink {
    runtime: Runtime,
    handle: Handle,
}

impl NetLink {
    /// Open a netlink socket in the current network namespace
    pub fn connect() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .map_err(|e| TaskError::unknown(format!("netlink runtime: {}", e)))?;

        let _enter = runtime.enter();
        let (connection, handle, _messages) = rtnetlink::new_connection()
            .map_err(|e| TaskError::unknown(format!("netlink connect: {}", e)))?;
        runtime.spawn(connection);
        drop(_enter);

        Ok(Self { runtime, handle })
    }

    /// All links visible in this namespace as (index, name) pairs
    pub fn links(&self) -> Result<Vec<(u32, String)>> {
        let handle = self.handle.clone();
        self.runtime.block_on(async move {
            let mut response = handle.link().get().execute();
            let mut links = Vec::new();
            while let Some(msg) = response
                .try_next()
                .await
                .map_err(|e| TaskError::unknown(format!("link dump: {}", e)))?
            {
                for attr in &msg.attributes {
                    if let LinkAttribute::IfName(name) = attr {
                        links.push((msg.header.index, name.clone()));
                        break;
                    }
                }
            }
            Ok(links)
        })
    }

    /// Look up a link index by name; the link must exist
    pub fn link_index(&self, name: &str) -> Result<u32> {
        let handle = self.handle.clone();
        let wanted = name.to_string();
        self.runtime.block_on(async move {
            let mut response = handle.link().get().match_name(wanted.clone()).execute();
            match response.try_next().await {
                Ok(Some(msg)) => Ok(msg.header.index),
                Ok(None) => Err(TaskError::invalid_value(format!("no such link: {}", wanted))),
                Err(e) => Err(TaskError::unknown(format!("lookup {}: {}", wanted, e))),
            }
        })
    }

    /// Bring a link up
    pub fn up(&self, index: u32) -> Result<()> {
        let handle = self.handle.clone();
        self.runtime.block_on(async move {
            handle
                .link()
                .set(LinkUnspec::new_with_index(index).up().build())
                .execute()
                .await
                .map_err(|e| TaskError::unknown(format!("link up {}: {}", index, e)))
        })
    }

    /// Assign an address with prefix length to a link
    pub fn set_ip_addr(&self, index: u32, addr: IpAddr, prefix: u8) -> Result<()> {
        let handle = self.handle.clone();
        self.runtime.block_on(async move {
            handle
                .address()
                .add(index, addr, prefix)
                .execute()
                .await
                .map_err(|e| TaskError::unknown(format!("addr add {}/{}: {}", addr, prefix, e)))
        })
    }

    /// Install a default route through `gw`
    pub fn set_default_gw(&self, gw: IpAddr) -> Result<()> {
        let handle = self.handle.clone();
        self.runtime.block_on(async move {
            let result = match gw {
                IpAddr::V4(v4) => {
                    let route = RouteMessageBuilder::<Ipv4Addr>::new().gateway(v4).build();
                    handle.route().add(route).execute().await
                }
                IpAddr::V6(v6) => {
                    let route = RouteMessageBuilder::<Ipv6Addr>::new().gateway(v6).build();
                    handle.route().add(route).execute().await
                }
            };
            result.map_err(|e| TaskError::unknown(format!("route add default via {}: {}", gw, e)))
        })
    }

    /// Move a link into `pid`'s network namespace, renaming it to `name`
    /// on the way
    pub fn change_ns(&self, index: u32, name: &str, pid: libc::pid_t) -> Result<()> {
        let handle = self.handle.clone();
        let name = name.to_string();
        self.runtime.block_on(async move {
            handle
                .link()
                .set(
                    LinkUnspec::new_with_index(index)
                        .name(name.clone())
                        .setns_by_pid(pid as u32)
                        .build(),
                )
                .execute()
                .await
                .map_err(|e| TaskError::unknown(format!("move {} to pid {}: {}", name, pid, e)))
        })
    }

    /// Create an ipvlan on top of `master`
    pub fn add_ip_vlan(&self, name: &str, master: &str, mode: &str, mtu: i32) -> Result<()> {
        let master_index = self.link_index(master)?;
        let mode = ipvlan_mode(mode)?;
        let handle = self.handle.clone();
        let name = name.to_string();
        self.runtime.block_on(async move {
            let mut builder = LinkMessageBuilder::<LinkUnspec>::new_with_info_kind(InfoKind::IpVlan)
                .name(name.clone())
                .link(master_index)
                .set_info_data(InfoData::IpVlan(vec![InfoIpVlan::Mode(mode)]));
            if mtu > 0 {
                builder = builder.mtu(mtu as u32);
            }
            handle
                .link()
                .add(builder.build())
                .execute()
                .await
                .map_err(|e| TaskError::unknown(format!("ipvlan add {}: {}", name, e)))
        })
    }

    /// Create a macvlan on top of `master` with an explicit hardware
    /// address
    pub fn add_mac_vlan(
        &self,
        name: &str,
        master: &str,
        mode: &str,
        hw: &str,
        mtu: i32,
    ) -> Result<()> {
        let master_index = self.link_index(master)?;
        let mode = macvlan_mode(mode)?;
        let address = parse_hw(hw)
            .ok_or_else(|| TaskError::invalid_value(format!("invalid hw address: {}", hw)))?;
        let handle = self.handle.clone();
        let name = name.to_string();
        self.runtime.block_on(async move {
            let mut builder = LinkMacVlan::new(&name, master_index, mode).address(address);
            if mtu > 0 {
                builder = builder.mtu(mtu as u32);
            }
            handle
                .link()
                .add(builder.build())
                .execute()
                .await
                .map_err(|e| TaskError::unknown(format!("macvlan add {}: {}", name, e)))
        })
    }

    /// Create a veth pair: `peer` stays in this namespace enslaved to the
    /// bridge at `bridge_index`, `name` gets `hw`/`mtu` applied and moves
    /// into `pid`'s namespace
    pub fn add_veth(
        &self,
        name: &str,
        peer: &str,
        hw: &str,
        mtu: i32,
        bridge_index: u32,
        pid: libc::pid_t,
    ) -> Result<()> {
        let address = parse_hw(hw)
            .ok_or_else(|| TaskError::invalid_value(format!("invalid hw address: {}", hw)))?;

        let handle = self.handle.clone();
        let pair = LinkVeth::new(name, peer).build();
        self.runtime.block_on(async move {
            handle
                .link()
                .add(pair)
                .execute()
                .await
                .map_err(|e| TaskError::unknown(format!("veth add {}: {}", name, e)))
        })?;

        let child_index = self.link_index(name)?;
        let peer_index = self.link_index(peer)?;
        debug!("veth {} ({}) peer {} ({})", name, child_index, peer, peer_index);

        let handle = self.handle.clone();
        self.runtime.block_on(async move {
            handle
                .link()
                .set(
                    LinkUnspec::new_with_index(peer_index)
                        .controller(bridge_index)
                        .up()
                        .build(),
                )
                .execute()
                .await
                .map_err(|e| TaskError::unknown(format!("enslave {}: {}", peer, e)))
        })?;

        let handle = self.handle.clone();
        self.runtime.block_on(async move {
            let mut builder = LinkUnspec::new_with_index(child_index).address(address);
            if mtu > 0 {
                builder = builder.mtu(mtu as u32);
            }
            handle
                .link()
                .set(builder.setns_by_pid(pid as u32).build())
                .execute()
                .await
                .map_err(|e| TaskError::unknown(format!("move {} to pid {}: {}", name, pid, e)))
        })
    }

    /// Delete a link; missing links are not an error
    pub fn remove(&self, name: &str) -> Result<()> {
        let Ok(index) = self.link_index(name) else {
            return Ok(());
        };
        let handle = self.handle.clone();
        self.runtime.block_on(async move {
            handle
                .link()
                .del(index)
                .execute()
                .await
                .map_err(|e| TaskError::unknown(format!("link del {}: {}", index, e)))
        })
    }
}

fn macvlan_mode(mode: &str) -> Result<MacVlanMode> {
    match mode {
        "private" => Ok(MacVlanMode::Private),
        "vepa" => Ok(MacVlanMode::Vepa),
        "" | "bridge" => Ok(MacVlanMode::Bridge),
        "passthru" => Ok(MacVlanMode::Passthrough),
        other => Err(TaskError::invalid_value(format!(
            "unknown macvlan mode: {}",
            other
        ))),
    }
}

fn ipvlan_mode(mode: &str) -> Result<IpVlanMode> {
    match mode {
        "" | "l2" => Ok(IpVlanMode::L2),
        "l3" => Ok(IpVlanMode::L3),
        "l3s" => Ok(IpVlanMode::L3S),
        other => Err(TaskError::invalid_value(format!(
            "unknown ipvlan mode: {}",
            other
        ))),
    }
}
