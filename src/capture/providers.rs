//! Trace providers the capture session enables, and the event ids it decodes.

use crate::config::ProviderToggles;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Microsoft-Windows-Kernel-Network: TCP/UDP send, receive, connect, disconnect.
    KernelNetwork,
    WinsockAfd,
    DnsClient,
    HttpService,
    NetworkProfile,
}

const KERNEL_NETWORK_GUID: u128 = 0x7dd42a49_5329_4832_8dfd_43d979153a88;
const WINSOCK_AFD_GUID: u128 = 0xe53c6823_7bb8_44bb_90dc_3f86090d48a6;
const DNS_CLIENT_GUID: u128 = 0x1c95126e_7eea_49a9_a3fe_a378b03ddb4d;
const HTTP_SERVICE_GUID: u128 = 0xdd5ef90a_6398_47a4_ad34_4dcecdef795f;
const NETWORK_PROFILE_GUID: u128 = 0xfbcfac3f_8459_419f_8e48_1f0b49cdb85e;

const KERNEL_NETWORK_KEYWORD_IPV4: u64 = 0x10;
const KERNEL_NETWORK_KEYWORD_IPV6: u64 = 0x20;

pub const TRACE_LEVEL_INFORMATION: u8 = 4;
pub const TRACE_LEVEL_VERBOSE: u8 = 5;

pub mod kernel_network {
    pub const TCP_SEND_V4: u16 = 10;
    pub const TCP_RECV_V4: u16 = 11;
    pub const TCP_CONNECT_V4: u16 = 12;
    pub const TCP_DISCONNECT_V4: u16 = 13;
    pub const TCP_ACCEPT_V4: u16 = 15;
    pub const TCP_SEND_V6: u16 = 26;
    pub const TCP_RECV_V6: u16 = 27;
    pub const TCP_CONNECT_V6: u16 = 28;
    pub const TCP_DISCONNECT_V6: u16 = 29;
    pub const TCP_ACCEPT_V6: u16 = 31;
    pub const UDP_SEND_V4: u16 = 42;
    pub const UDP_RECV_V4: u16 = 43;
    pub const UDP_SEND_V6: u16 = 58;
    pub const UDP_RECV_V6: u16 = 59;
}

pub mod dns_client {
    pub const QUERY_COMPLETED: u16 = 3008;
}

pub mod http_service {
    pub const REQUEST_PARSED: u16 = 2;
}

pub mod network_profile {
    pub const NETWORK_CONNECTED: u16 = 10000;
    pub const NETWORK_DISCONNECTED: u16 = 10001;
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::KernelNetwork,
        Provider::WinsockAfd,
        Provider::DnsClient,
        Provider::HttpService,
        Provider::NetworkProfile,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::KernelNetwork => "Microsoft-Windows-Kernel-Network",
            Self::WinsockAfd => "Microsoft-Windows-Winsock-AFD",
            Self::DnsClient => "Microsoft-Windows-DNS-Client",
            Self::HttpService => "Microsoft-Windows-HttpService",
            Self::NetworkProfile => "Microsoft-Windows-NetworkProfile",
        }
    }

    pub fn guid_u128(&self) -> u128 {
        match self {
            Self::KernelNetwork => KERNEL_NETWORK_GUID,
            Self::WinsockAfd => WINSOCK_AFD_GUID,
            Self::DnsClient => DNS_CLIENT_GUID,
            Self::HttpService => HTTP_SERVICE_GUID,
            Self::NetworkProfile => NETWORK_PROFILE_GUID,
        }
    }

    pub fn from_guid_u128(guid: u128) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.guid_u128() == guid)
    }

    pub fn keywords(&self) -> u64 {
        match self {
            Self::KernelNetwork => KERNEL_NETWORK_KEYWORD_IPV4 | KERNEL_NETWORK_KEYWORD_IPV6,
            _ => u64::MAX,
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            Self::KernelNetwork | Self::NetworkProfile => TRACE_LEVEL_INFORMATION,
            _ => TRACE_LEVEL_VERBOSE,
        }
    }

    pub fn is_enabled(&self, toggles: &ProviderToggles) -> bool {
        match self {
            Self::KernelNetwork => toggles.tcpip,
            Self::WinsockAfd => toggles.winsock,
            Self::DnsClient => toggles.dns,
            Self::HttpService => toggles.http,
            Self::NetworkProfile => toggles.network_profile,
        }
    }
}

pub fn enabled_providers(toggles: &ProviderToggles) -> Vec<Provider> {
    Provider::ALL
        .into_iter()
        .filter(|p| p.is_enabled(toggles))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_lookup_roundtrips_for_every_provider() {
        for provider in Provider::ALL {
            assert_eq!(Provider::from_guid_u128(provider.guid_u128()), Some(provider));
        }
        assert_eq!(Provider::from_guid_u128(0), None);
    }

    #[test]
    fn toggles_filter_providers() {
        let toggles = ProviderToggles {
            winsock: false,
            http: false,
            ..ProviderToggles::default()
        };
        let enabled = enabled_providers(&toggles);
        assert_eq!(
            enabled,
            vec![Provider::KernelNetwork, Provider::DnsClient, Provider::NetworkProfile]
        );
    }
}
