use super::{EntitySchema, FieldMetadata, FieldType};

pub(super) fn azure_entities() -> Vec<EntitySchema> {
    vec![azure_users(), azure_groups(), azure_devices()]
}

pub(super) fn o365_entities() -> Vec<EntitySchema> {
    vec![o365_users(), o365_groups(), mailbox_usage()]
}

fn azure_users() -> EntitySchema {
    use FieldType::*;
    EntitySchema::new(
        "users",
        "Users",
        "users",
        &["displayName", "userPrincipalName", "mail", "accountEnabled", "userType"],
        vec![
            FieldMetadata::new("id", "Object ID", String, "identity", "id"),
            FieldMetadata::new("displayName", "Display Name", String, "identity", "displayName"),
            FieldMetadata::new(
                "userPrincipalName",
                "User Principal Name",
                String,
                "identity",
                "userPrincipalName",
            ),
            FieldMetadata::new("mail", "Email", String, "identity", "mail"),
            FieldMetadata::new("givenName", "First Name", String, "identity", "givenName"),
            FieldMetadata::new("surname", "Last Name", String, "identity", "surname"),
            FieldMetadata::new("userType", "User Type", String, "identity", "userType")
                .describe("Member or Guest"),
            FieldMetadata::new("jobTitle", "Job Title", String, "organization", "jobTitle"),
            FieldMetadata::new("department", "Department", String, "organization", "department"),
            FieldMetadata::new("companyName", "Company", String, "organization", "companyName"),
            FieldMetadata::new(
                "officeLocation",
                "Office",
                String,
                "organization",
                "officeLocation",
            ),
            FieldMetadata::new("city", "City", String, "organization", "city"),
            FieldMetadata::new("country", "Country", String, "organization", "country"),
            FieldMetadata::new("mobilePhone", "Mobile Phone", String, "organization", "mobilePhone"),
            FieldMetadata::new(
                "accountEnabled",
                "Account Enabled",
                Boolean,
                "account",
                "accountEnabled",
            ),
            FieldMetadata::new(
                "onPremisesSyncEnabled",
                "Synced From On-Premises",
                Boolean,
                "account",
                "onPremisesSyncEnabled",
            ),
            FieldMetadata::new("usageLocation", "Usage Location", String, "licensing", "usageLocation"),
            FieldMetadata::new(
                "assignedLicenses",
                "Assigned Licenses",
                Array,
                "licensing",
                "assignedLicenses",
            ),
            FieldMetadata::new(
                "createdDateTime",
                "Created",
                Datetime,
                "activity",
                "createdDateTime",
            ),
            FieldMetadata::new(
                "lastPasswordChange",
                "Last Password Change",
                Datetime,
                "security",
                "lastPasswordChangeDateTime",
            ),
            FieldMetadata::new(
                "lastSignIn",
                "Last Sign-In",
                Datetime,
                "activity",
                "signInActivity/lastSignInDateTime",
            )
            .describe("Requires Azure AD Premium and AuditLog.Read.All"),
        ],
    )
}

fn azure_groups() -> EntitySchema {
    use FieldType::*;
    EntitySchema::new(
        "groups",
        "Groups",
        "groups",
        &["displayName", "mail", "securityEnabled", "groupTypes"],
        vec![
            FieldMetadata::new("id", "Object ID", String, "identity", "id"),
            FieldMetadata::new("displayName", "Display Name", String, "identity", "displayName"),
            FieldMetadata::new("description", "Description", String, "identity", "description"),
            FieldMetadata::new("mail", "Email", String, "identity", "mail"),
            FieldMetadata::new("mailEnabled", "Mail Enabled", Boolean, "type", "mailEnabled"),
            FieldMetadata::new(
                "securityEnabled",
                "Security Enabled",
                Boolean,
                "type",
                "securityEnabled",
            ),
            FieldMetadata::new("groupTypes", "Group Types", Array, "type", "groupTypes"),
            FieldMetadata::new("visibility", "Visibility", String, "type", "visibility"),
            FieldMetadata::new(
                "membershipRule",
                "Membership Rule",
                String,
                "membership",
                "membershipRule",
            ),
            FieldMetadata::new(
                "createdDateTime",
                "Created",
                Datetime,
                "activity",
                "createdDateTime",
            ),
        ],
    )
}

fn azure_devices() -> EntitySchema {
    use FieldType::*;
    EntitySchema::new(
        "devices",
        "Devices",
        "devices",
        &["displayName", "operatingSystem", "trustType", "approximateLastSignIn"],
        vec![
            FieldMetadata::new("id", "Object ID", String, "identity", "id"),
            FieldMetadata::new("displayName", "Display Name", String, "identity", "displayName"),
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
            FieldMetadata::new("trustType", "Join Type", String, "system", "trustType"),
            FieldMetadata::new(
                "accountEnabled",
                "Account Enabled",
                Boolean,
                "compliance",
                "accountEnabled",
            ),
            FieldMetadata::new("isCompliant", "Compliant", Boolean, "compliance", "isCompliant"),
            FieldMetadata::new("isManaged", "Managed", Boolean, "compliance", "isManaged"),
            FieldMetadata::new(
                "approximateLastSignIn",
                "Last Sign-In",
                Datetime,
                "activity",
                "approximateLastSignInDateTime",
            ),
            FieldMetadata::new(
                "registrationDateTime",
                "Registered",
                Datetime,
                "activity",
                "registrationDateTime",
            ),
        ],
    )
}

fn o365_users() -> EntitySchema {
    use FieldType::*;
    EntitySchema::new(
        "users",
        "Licensed Users",
        "users",
        &["displayName", "userPrincipalName", "assignedLicenses", "usageLocation"],
        vec![
            FieldMetadata::new("id", "Object ID", String, "identity", "id"),
            FieldMetadata::new("displayName", "Display Name", String, "identity", "displayName"),
            FieldMetadata::new(
                "userPrincipalName",
                "User Principal Name",
                String,
                "identity",
                "userPrincipalName",
            ),
            FieldMetadata::new("mail", "Email", String, "identity", "mail"),
            FieldMetadata::new(
                "proxyAddresses",
                "Proxy Addresses",
                Array,
                "mail",
                "proxyAddresses",
            ),
            FieldMetadata::new(
                "accountEnabled",
                "Account Enabled",
                Boolean,
                "account",
                "accountEnabled",
            ),
            FieldMetadata::new("usageLocation", "Usage Location", String, "licensing", "usageLocation"),
            FieldMetadata::new(
                "assignedLicenses",
                "Assigned Licenses",
                Array,
                "licensing",
                "assignedLicenses",
            ),
            FieldMetadata::new("assignedPlans", "Assigned Plans", Array, "licensing", "assignedPlans"),
            FieldMetadata::new(
                "createdDateTime",
                "Created",
                Datetime,
                "activity",
                "createdDateTime",
            ),
        ],
    )
}

fn o365_groups() -> EntitySchema {
    use FieldType::*;
    EntitySchema::new(
        "groups",
        "Microsoft 365 Groups",
        "groups",
        &["displayName", "mail", "visibility", "createdDateTime"],
        vec![
            FieldMetadata::new("id", "Object ID", String, "identity", "id"),
            FieldMetadata::new("displayName", "Display Name", String, "identity", "displayName"),
            FieldMetadata::new("mail", "Email", String, "identity", "mail"),
            FieldMetadata::new("visibility", "Visibility", String, "type", "visibility"),
            FieldMetadata::new("groupTypes", "Group Types", Array, "type", "groupTypes"),
            FieldMetadata::new(
                "resourceProvisioningOptions",
                "Provisioning Options",
                Array,
                "type",
                "resourceProvisioningOptions",
            )
            .describe("Contains \"Team\" for Teams-enabled groups"),
            FieldMetadata::new(
                "createdDateTime",
                "Created",
                Datetime,
                "activity",
                "createdDateTime",
            ),
            FieldMetadata::new(
                "renewedDateTime",
                "Renewed",
                Datetime,
                "activity",
                "renewedDateTime",
            ),
        ],
    )
}

fn mailbox_usage() -> EntitySchema {
    use FieldType::*;
    EntitySchema::new(
        "mailboxUsage",
        "Mailbox Usage",
        "reports/getMailboxUsageDetail(period='D30')",
        &["userPrincipalName", "displayName", "storageUsedInBytes", "lastActivityDate"],
        vec![
            FieldMetadata::new(
                "userPrincipalName",
                "User Principal Name",
                String,
                "identity",
                "userPrincipalName",
            ),
            FieldMetadata::new("displayName", "Display Name", String, "identity", "displayName"),
            FieldMetadata::new("isDeleted", "Deleted", Boolean, "identity", "isDeleted"),
            FieldMetadata::new("itemCount", "Item Count", Integer, "usage", "itemCount"),
            FieldMetadata::new(
                "storageUsedInBytes",
                "Storage Used (bytes)",
                Integer,
                "usage",
                "storageUsedInBytes",
            ),
            FieldMetadata::new(
                "prohibitSendQuotaInBytes",
                "Prohibit Send Quota (bytes)",
                Integer,
                "usage",
                "prohibitSendQuotaInBytes",
            ),
            FieldMetadata::new(
                "lastActivityDate",
                "Last Activity",
                Datetime,
                "activity",
                "lastActivityDate",
            ),
            FieldMetadata::new(
                "reportRefreshDate",
                "Report Date",
                Datetime,
                "activity",
                "reportRefreshDate",
            ),
        ],
    )
}
