use super::{EntitySchema, FieldMetadata, FieldType};
use crate::backend::DiscoveredAttribute;

pub(super) const USERS: &str = "users";
pub(super) const DISCOVERED_CATEGORY: &str = "discovered";

pub(super) fn entities() -> Vec<EntitySchema> {
    vec![users(), groups(), computers()]
}

fn users() -> EntitySchema {
    use FieldType::*;
    EntitySchema::new(
        USERS,
        "Users",
        "(&(objectCategory=person)(objectClass=user))",
        &["username", "displayName", "email", "department", "lastLogon"],
        vec![
            FieldMetadata::new("username", "Username", String, "identity", "sAMAccountName"),
            FieldMetadata::new("displayName", "Display Name", String, "identity", "displayName"),
            FieldMetadata::new("firstName", "First Name", String, "identity", "givenName"),
            FieldMetadata::new("lastName", "Last Name", String, "identity", "sn"),
            FieldMetadata::new(
                "userPrincipalName",
                "User Principal Name",
                String,
                "identity",
                "userPrincipalName",
            ),
            FieldMetadata::new("email", "Email", String, "identity", "mail"),
            FieldMetadata::new(
                "distinguishedName",
                "Distinguished Name",
                String,
                "identity",
                "distinguishedName",
            ),
            FieldMetadata::new("employeeId", "Employee ID", String, "identity", "employeeID"),
            FieldMetadata::new("department", "Department", String, "organization", "department"),
            FieldMetadata::new("title", "Job Title", String, "organization", "title"),
            FieldMetadata::new("company", "Company", String, "organization", "company"),
            FieldMetadata::new("manager", "Manager", String, "organization", "manager"),
            FieldMetadata::new(
                "office",
                "Office",
                String,
                "organization",
                "physicalDeliveryOfficeName",
            ),
            FieldMetadata::new("phone", "Telephone", String, "organization", "telephoneNumber"),
            FieldMetadata::new("description", "Description", String, "organization", "description"),
            FieldMetadata::new(
                "userAccountControl",
                "Account Control Flags",
                Integer,
                "account",
                "userAccountControl",
            )
            .describe("Bit flags; 0x2 = disabled, 0x10000 = password never expires"),
            FieldMetadata::new(
                "accountExpires",
                "Account Expires",
                Datetime,
                "account",
                "accountExpires",
            ),
            FieldMetadata::new("memberOf", "Member Of", Array, "security", "memberOf"),
            FieldMetadata::new("adminCount", "Admin Count", Integer, "security", "adminCount"),
            FieldMetadata::new(
                "passwordLastSet",
                "Password Last Set",
                Datetime,
                "security",
                "pwdLastSet",
            ),
            FieldMetadata::new("lockoutTime", "Lockout Time", Datetime, "security", "lockoutTime"),
            FieldMetadata::new(
                "badPasswordCount",
                "Bad Password Count",
                Integer,
                "security",
                "badPwdCount",
            ),
            FieldMetadata::new(
                "lastLogon",
                "Last Logon",
                Datetime,
                "activity",
                "lastLogonTimestamp",
            )
            .describe("Replicated last logon; may lag the real value by up to 14 days"),
            FieldMetadata::new("logonCount", "Logon Count", Integer, "activity", "logonCount"),
            FieldMetadata::new("whenCreated", "Created", Datetime, "activity", "whenCreated"),
            FieldMetadata::new("whenChanged", "Modified", Datetime, "activity", "whenChanged"),
        ],
    )
}

fn groups() -> EntitySchema {
    use FieldType::*;
    EntitySchema::new(
        "groups",
        "Groups",
        "(objectCategory=group)",
        &["name", "description", "groupType", "whenCreated"],
        vec![
            FieldMetadata::new("name", "Name", String, "identity", "cn"),
            FieldMetadata::new("groupName", "Group Name", String, "identity", "sAMAccountName"),
            FieldMetadata::new(
                "distinguishedName",
                "Distinguished Name",
                String,
                "identity",
                "distinguishedName",
            ),
            FieldMetadata::new("email", "Email", String, "identity", "mail"),
            FieldMetadata::new("description", "Description", String, "identity", "description"),
            FieldMetadata::new("groupType", "Group Type", Integer, "membership", "groupType"),
            FieldMetadata::new("members", "Members", Array, "membership", "member"),
            FieldMetadata::new("memberOf", "Member Of", Array, "membership", "memberOf"),
            FieldMetadata::new("managedBy", "Managed By", String, "membership", "managedBy"),
            FieldMetadata::new("adminCount", "Admin Count", Integer, "security", "adminCount"),
            FieldMetadata::new("whenCreated", "Created", Datetime, "activity", "whenCreated"),
            FieldMetadata::new("whenChanged", "Modified", Datetime, "activity", "whenChanged"),
        ],
    )
}

fn computers() -> EntitySchema {
    use FieldType::*;
    EntitySchema::new(
        "computers",
        "Computers",
        "(objectCategory=computer)",
        &["name", "dnsHostName", "operatingSystem", "lastLogon"],
        vec![
            FieldMetadata::new("name", "Name", String, "identity", "cn"),
            FieldMetadata::new("dnsHostName", "DNS Host Name", String, "identity", "dNSHostName"),
            FieldMetadata::new(
                "distinguishedName",
                "Distinguished Name",
                String,
                "identity",
                "distinguishedName",
            ),
            FieldMetadata::new("description", "Description", String, "identity", "description"),
            FieldMetadata::new("location", "Location", String, "identity", "location"),
            FieldMetadata::new(
                "operatingSystem",
                "Operating System",
                String,
                "system",
                "operatingSystem",
            ),
            FieldMetadata::new(
                "operatingSystemVersion",
                "OS Version",
                String,
                "system",
                "operatingSystemVersion",
            ),
            FieldMetadata::new(
                "userAccountControl",
                "Account Control Flags",
                Integer,
                "account",
                "userAccountControl",
            ),
            FieldMetadata::new(
                "lastLogon",
                "Last Logon",
                Datetime,
                "activity",
                "lastLogonTimestamp",
            ),
            FieldMetadata::new("whenCreated", "Created", Datetime, "activity", "whenCreated"),
            FieldMetadata::new("whenChanged", "Modified", Datetime, "activity", "whenChanged"),
        ],
    )
}

/// Maps an `attributeSchema` entry onto a catalog field.
pub(super) fn discovered_field(attr: DiscoveredAttribute) -> FieldMetadata {
    let field_type = if !attr.single_valued {
        FieldType::Array
    } else {
        match attr.syntax.as_str() {
            // Boolean
            "2.5.5.8" => FieldType::Boolean,
            // Integer, Large-Integer
            "2.5.5.9" | "2.5.5.16" => FieldType::Integer,
            // Generalized-Time, UTC-Time
            "2.5.5.11" => FieldType::Datetime,
            _ => FieldType::String,
        }
    };

    let mut field = FieldMetadata::new(
        &attr.name,
        &attr.name,
        field_type,
        DISCOVERED_CATEGORY,
        &attr.name,
    );
    field.entity = USERS.to_string();
    field
}
