use super::*;

#[test]
fn bind_interface_follows_address_family() {
    let v6 = ServerAddressIp::new("::1".parse().expect("ip"), DEFAULT_MATTER_PORT);
    assert_eq!(v6.bind_interface(), BIND_ALL_IPV6);

    let v4 = ServerAddressIp::new("127.0.0.1".parse().expect("ip"), DEFAULT_MATTER_PORT);
    assert_eq!(v4.bind_interface(), BIND_ALL_IPV4);
}

#[test]
fn server_address_renders_as_socket_addr() {
    let v6 = ServerAddressIp::new("fe80::1".parse().expect("ip"), 5540);
    assert_eq!(v6.to_string(), "[fe80::1]:5540");
    let v4 = ServerAddressIp::new("10.0.0.7".parse().expect("ip"), 5541);
    assert_eq!(v4.to_string(), "10.0.0.7:5541");
}

#[tokio::test]
async fn interface_set_lookup_by_type_and_bind() {
    let udp = Arc::new(UdpInterface::bind(BIND_ALL_IPV4).await.expect("bind"));
    let mut set = NetInterfaceSet::new();
    set.add_interface(ChannelType::Udp, BIND_ALL_IPV4, udp);

    assert!(set.interface_for(ChannelType::Udp, BIND_ALL_IPV4).is_some());
    assert!(set.interface_for(ChannelType::Udp, BIND_ALL_IPV6).is_none());
    assert!(set.interface_for(ChannelType::Ble, BIND_ALL_IPV4).is_none());
}

#[tokio::test]
async fn udp_channels_share_the_interface_socket() {
    let interface = UdpInterface::bind(BIND_ALL_IPV4).await.expect("bind");
    let local = interface.local_addr().expect("local addr");

    let peer = ServerAddressIp::new("127.0.0.1".parse().expect("ip"), local.port());
    let channel = interface.open_channel(peer).await.expect("open");
    assert_eq!(channel.peer(), peer);

    // Loopback send to our own port succeeds.
    channel.send(b"ping").await.expect("send");
}
