//! ACL schema integration tests

use std::collections::BTreeMap;

use steward::auth::acl::{CentralAuth, HostAcl, Present};

fn decode(data: &[u8]) -> HostAcl {
    serde_cbor::from_slice(data).expect("generated acl decodes")
}

#[test]
fn test_single_node_acl() {
    let mut central = CentralAuth::new();
    central.acl_add_command("ship101", "admin", "HORSE");
    central.acl_add_command("ship101", "admin", "PIG");

    let generated = central.generated_for("ship101").expect("acl generated");
    let acl = decode(&generated.data);

    let commands = acl.get("admin").expect("admin has commands");
    assert!(commands.contains_key("HORSE"));
    assert!(commands.contains_key("PIG"));
    assert_eq!(commands.len(), 2);
}

#[test]
fn test_group_expansion() {
    let mut central = CentralAuth::new();
    central.group_nodes_add_node("grp_nodes_ships", "ship100");
    central.group_nodes_add_node("grp_nodes_ships", "ship101");
    central.group_nodes_add_node("grp_nodes_operators", "operator1");
    central.group_nodes_add_node("grp_nodes_operators", "operator2");
    central.group_commands_add_command("grp_cmds_commandset1", "dmesg");
    central.group_commands_add_command("grp_cmds_commandset1", "date");

    central.acl_add_command("grp_nodes_ships", "grp_nodes_operators", "grp_cmds_commandset1");

    let commandset: BTreeMap<String, Present> = [("date", Present {}), ("dmesg", Present {})]
        .into_iter()
        .map(|(c, p)| (c.to_string(), p))
        .collect();
    let want: HostAcl = BTreeMap::from([
        ("operator1".to_string(), commandset.clone()),
        ("operator2".to_string(), commandset),
    ]);

    for ship in ["ship100", "ship101"] {
        let generated = central.generated_for(ship).expect("acl generated");
        assert_eq!(decode(&generated.data), want, "acl for {ship}");
    }
}

#[test]
fn test_hash_stability() {
    let mut central = CentralAuth::new();

    central.acl_add_command("ship101", "admin", "HORSE");
    central.group_nodes_add_node("grp_nodes_ships", "ship101");
    central.acl_add_command("grp_nodes_ships", "admin", "HEN");

    let want: [u8; 32] = [
        0xa4, 0x99, 0xbd, 0xa3, 0x18, 0x26, 0x52, 0xc2, 0x92, 0x60, 0x23, 0x19, 0x3c, 0x0a, 0x07,
        0xa9, 0xb7, 0x77, 0x4f, 0x11, 0x34, 0xd5, 0x2d, 0xd1, 0x8d, 0xab, 0x6c, 0x4b, 0x02, 0xfa,
        0x5c, 0x7a,
    ];

    let generated = central.generated_for("ship101").expect("acl generated");
    assert_eq!(generated.hash, want);
    assert_eq!(central.hash_for("ship101"), Some(want));

    let acl = decode(&generated.data);
    let commands = acl.get("admin").unwrap();
    assert!(commands.contains_key("HEN"));
    assert!(commands.contains_key("HORSE"));
    assert_eq!(commands.len(), 2);
}

#[test]
fn test_export_import_regenerates_identically() {
    let mut central = CentralAuth::new();
    central.group_nodes_add_node("grp_nodes_ships", "ship100");
    central.group_nodes_add_node("grp_nodes_ships", "ship101");
    central.acl_add_command("grp_nodes_ships", "admin", "HEN");
    central.acl_add_command("ship101", "operator1", "date");

    let exported = central.export().unwrap();

    let mut imported = CentralAuth::new();
    imported.import(&exported).unwrap();

    for ship in ["ship100", "ship101"] {
        assert_eq!(
            central.generated_for(ship).map(|g| g.hash),
            imported.generated_for(ship).map(|g| g.hash),
            "hash for {ship}"
        );
        assert_eq!(
            central.generated_for(ship).map(|g| g.data.clone()),
            imported.generated_for(ship).map(|g| g.data.clone()),
            "data for {ship}"
        );
    }

    // A re-export of the import round-trips too.
    assert_eq!(exported, imported.export().unwrap());
}

#[test]
fn test_group_membership_changes_propagate() {
    let mut central = CentralAuth::new();
    central.group_nodes_add_node("grp_nodes_ships", "ship100");
    central.acl_add_command("grp_nodes_ships", "admin", "HEN");

    assert!(central.generated_for("ship100").is_some());
    assert!(central.generated_for("ship101").is_none());

    central.group_nodes_add_node("grp_nodes_ships", "ship101");
    assert!(central.generated_for("ship101").is_some());

    central.group_nodes_delete_node("grp_nodes_ships", "ship100");
    assert!(central.generated_for("ship100").is_none());

    central.group_nodes_delete_group("grp_nodes_ships");
    assert!(central.generated_for("ship101").is_none());
}
